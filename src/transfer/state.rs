//! Transfer lifecycle states and the transitions allowed between them

use std::fmt;

use thiserror::Error;

use super::types::ReplaceOptions;
use crate::amount::Amount;

/// Why a submission failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSubmitError {
    #[error("nonce too low")]
    NonceTooLow,

    #[error("gas price too low")]
    GasPriceTooLow,

    #[error("gas too low")]
    GasTooLow,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("balance too low")]
    BalanceTooLow,

    #[error("dropped from the mempool")]
    Dropped,

    #[error("replacement under-priced")]
    ReplacementUnderPriced,

    #[error("system error {errnum}")]
    Posix { errnum: i32 },

    #[error("unknown submit error")]
    Unknown,
}

impl TransferSubmitError {
    /// Replacement settings that usually get a transfer failing this way accepted.
    ///
    /// `None` means resubmitting will not help.
    pub fn suggested_replacement(&self) -> Option<ReplaceOptions> {
        match self {
            Self::NonceTooLow => Some(ReplaceOptions {
                update_nonce: true,
                ..ReplaceOptions::default()
            }),
            Self::GasTooLow => Some(ReplaceOptions {
                update_gas_limit: true,
                ..ReplaceOptions::default()
            }),
            Self::GasPriceTooLow | Self::BalanceTooLow | Self::Dropped | Self::Unknown => {
                Some(ReplaceOptions {
                    update_gas_price: true,
                    ..ReplaceOptions::default()
                })
            }
            Self::InvalidSignature | Self::ReplacementUnderPriced | Self::Posix { .. } => None,
        }
    }
}

/// Where and when a transfer was included
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfirmation {
    pub block_number: u64,
    pub transaction_index: u64,
    /// Block time, seconds since the Unix epoch
    pub timestamp: u64,
    /// Fee actually paid, when the chain reports it
    pub fee: Option<Amount>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Created,
    Signed,
    Submitted,
    Pending,
    Included { confirmation: TransferConfirmation },
    Errored { error: TransferSubmitError },
    Cancelled,
    Replaced,
    Deleted,
}

impl TransferState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Signed => "signed",
            Self::Submitted => "submitted",
            Self::Pending => "pending",
            Self::Included { .. } => "included",
            Self::Errored { .. } => "errored",
            Self::Cancelled => "cancelled",
            Self::Replaced => "replaced",
            Self::Deleted => "deleted",
        }
    }

    /// Position along created → signed → submitted → pending → included
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Signed => Some(1),
            Self::Submitted => Some(2),
            Self::Pending => Some(3),
            Self::Included { .. } => Some(4),
            _ => None,
        }
    }

    /// Errored, cancelled, replaced and deleted end the forward chain
    pub fn is_terminal(&self) -> bool {
        self.rank().is_none()
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Whether the transfer has been handed to the network
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Pending | Self::Included { .. }
        )
    }

    pub fn confirmation(&self) -> Option<&TransferConfirmation> {
        match self {
            Self::Included { confirmation } => Some(confirmation),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<TransferSubmitError> {
        match self {
            Self::Errored { error } => Some(*error),
            _ => None,
        }
    }

    /// Forward along the chain, sideways into a terminal state, and from any terminal state
    /// only into deleted. Nothing leaves deleted and nothing returns to created.
    pub fn can_transition_to(&self, next: &TransferState) -> bool {
        match (self, next) {
            (Self::Deleted, _) => false,
            (_, Self::Deleted) => true,
            (current, _) if current.is_terminal() => false,
            (_, Self::Errored { .. } | Self::Cancelled | Self::Replaced) => true,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Included { confirmation } => write!(
                f,
                "included(block {}, index {})",
                confirmation.block_number, confirmation.transaction_index
            ),
            Self::Errored { error } => write!(f, "errored({})", error),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn included() -> TransferState {
        TransferState::Included {
            confirmation: TransferConfirmation {
                block_number: 10,
                transaction_index: 0,
                timestamp: 0,
                fee: None,
            },
        }
    }

    fn errored() -> TransferState {
        TransferState::Errored {
            error: TransferSubmitError::Dropped,
        }
    }

    #[test_case(TransferState::Created, TransferState::Signed, true ; "created to signed")]
    #[test_case(TransferState::Created, TransferState::Submitted, true ; "created skips ahead")]
    #[test_case(TransferState::Submitted, included(), true ; "submitted to included")]
    #[test_case(TransferState::Pending, TransferState::Submitted, false ; "no going back")]
    #[test_case(included(), TransferState::Pending, false ; "included stays included")]
    #[test_case(TransferState::Signed, TransferState::Created, false ; "never back to created")]
    #[test_case(TransferState::Submitted, errored(), true ; "submitted to errored")]
    #[test_case(TransferState::Pending, TransferState::Replaced, true ; "pending to replaced")]
    #[test_case(errored(), TransferState::Submitted, false ; "errored is terminal")]
    #[test_case(TransferState::Cancelled, TransferState::Deleted, true ; "cancelled deletable")]
    #[test_case(TransferState::Deleted, TransferState::Created, false ; "deleted absorbs")]
    #[test_case(TransferState::Deleted, TransferState::Deleted, false ; "deleted absorbs itself")]
    fn test_transitions(from: TransferState, to: TransferState, allowed: bool) {
        assert_eq!(from.can_transition_to(&to), allowed);
    }

    #[test]
    fn test_suggested_replacement() {
        let options = TransferSubmitError::NonceTooLow.suggested_replacement().unwrap();
        assert!(options.update_nonce && !options.update_gas_price);

        let options = TransferSubmitError::Dropped.suggested_replacement().unwrap();
        assert!(options.update_gas_price);

        assert!(TransferSubmitError::InvalidSignature
            .suggested_replacement()
            .is_none());
        assert_eq!(
            TransferSubmitError::Posix { errnum: 54 }.to_string(),
            "system error 54"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(included().to_string(), "included(block 10, index 0)");
        assert_eq!(errored().to_string(), "errored(dropped from the mempool)");
        assert!(errored().is_terminal());
        assert!(!included().is_terminal());
    }
}
