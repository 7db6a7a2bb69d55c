//! Command-line front end

pub mod commands;
pub mod listener;
