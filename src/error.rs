//! Error types for the wallet core

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the wallet core
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Engine errors
    #[error("Wallet engine rejected request: {0}")]
    Engine(String),

    #[error("Wallet engine unavailable")]
    EngineUnavailable,

    // Registry lookups
    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Wallet manager not found: {0}")]
    ManagerNotFound(u64),

    #[error("Wallet not found: {0}")]
    WalletNotFound(u64),

    #[error("Transfer not found: {0}")]
    TransferNotFound(u64),

    #[error("No unit {unit} for currency {currency}")]
    UnitNotFound { currency: String, unit: String },

    // Amount errors
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Amount overflow")]
    AmountOverflow,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    // Lifecycle errors
    #[error("Invalid transfer state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Event dispatch errors
    #[error("Event dispatch failed: {0}")]
    Dispatch(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EngineUnavailable | Error::Dispatch(_) | Error::Io(_)
        )
    }

    /// Check if this error reports a caller mistake rather than an environmental failure
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::CurrencyMismatch { .. }
                | Error::UnitNotFound { .. }
                | Error::InvalidTransition { .. }
                | Error::InvalidAmount(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(_: async_channel::SendError<T>) -> Self {
        Error::Dispatch("channel closed".to_string())
    }
}
