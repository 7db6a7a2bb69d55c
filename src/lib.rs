//! Wallet Kit Library
//!
//! Lifecycle core for wallet managers, wallets and transfers over a pluggable wallet engine,
//! with ordered, typed event propagation to a single listener.

pub mod amount;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod network;
pub mod system;
pub mod transfer;
pub mod wallet;

// Re-export commonly used types
pub use amount::{Amount, Currency, CurrencyPair, Unit};
pub use config::Config;
pub use engine::{ManagerHandle, TransferHandle, WalletEngine, WalletHandle};
pub use error::{Error, Result};
pub use manager::{WalletManager, WalletManagerEvent, WalletManagerMode, WalletManagerState};
pub use network::{Account, Address, Network};
pub use system::{System, SystemEvent, SystemListener};
pub use transfer::{Transfer, TransferDirection, TransferEvent, TransferState};
pub use wallet::{Wallet, WalletEvent, WalletState};
