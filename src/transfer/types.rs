//! Value types attached to transfers

use std::fmt;

use serde::{Deserialize, Serialize};

use super::state::TransferState;
use crate::amount::Amount;

/// Direction of a transfer relative to the wallet that holds it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Sent,
    Received,
    /// Both ends belong to the wallet
    Recovered,
}

impl TransferDirection {
    /// Derive the direction from which ends the wallet owns.
    ///
    /// `None` when the wallet owns neither end; such a transfer never belongs to it.
    pub fn from_ownership(source_owned: bool, target_owned: bool) -> Option<Self> {
        match (source_owned, target_owned) {
            (true, true) => Some(Self::Recovered),
            (true, false) => Some(Self::Sent),
            (false, true) => Some(Self::Received),
            (false, false) => None,
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Recovered => "recovered",
        })
    }
}

/// Parameters that determine a transfer's fee
#[derive(Debug, Clone, PartialEq)]
pub enum TransferFeeBasis {
    /// Fee scales with serialized size
    Bitcoin { fee_per_kb: u64 },
    /// Fee is price times limit; `gas_price` is in the network currency
    Ethereum { gas_price: Amount, gas_limit: u64 },
}

impl TransferFeeBasis {
    /// Fee in base units for a transaction of `size_bytes`
    pub fn fee_for_size(&self, size_bytes: u64) -> Option<i128> {
        match self {
            Self::Bitcoin { fee_per_kb } => {
                Some(i128::from(*fee_per_kb) * i128::from(size_bytes) / 1000)
            }
            Self::Ethereum {
                gas_price,
                gas_limit,
            } => gas_price.value().checked_mul(i128::from(*gas_limit)),
        }
    }
}

impl fmt::Display for TransferFeeBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitcoin { fee_per_kb } => write!(f, "{} per kB", fee_per_kb),
            Self::Ethereum {
                gas_price,
                gas_limit,
            } => write!(f, "{} x {} gas", gas_price, gas_limit),
        }
    }
}

/// A transaction hash as hex, assigned once a transfer is signed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferHash(String);

impl TransferHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which fee parameters a replacement transfer should change
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceOptions {
    pub update_nonce: bool,
    pub update_gas_price: bool,
    pub update_gas_limit: bool,
}

/// How a transfer supersedes an earlier one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplacementKind {
    Replace,
    Cancel,
}

impl ReplacementKind {
    /// State the superseded transfer takes once the new one is submitted
    pub fn superseded_state(&self) -> TransferState {
        match self {
            Self::Replace => TransferState::Replaced,
            Self::Cancel => TransferState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Created,
    Changed {
        old: TransferState,
        new: TransferState,
    },
    Confirmation {
        count: u64,
    },
    Deleted,
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Changed { old, new } => write!(f, "changed({} -> {})", old, new),
            Self::Confirmation { count } => write!(f, "confirmation({})", count),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::fixtures;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn direction_is_a_pure_function_of_ownership(
            source in any::<bool>(),
            target in any::<bool>(),
        ) {
            let first = TransferDirection::from_ownership(source, target);
            prop_assert_eq!(first, TransferDirection::from_ownership(source, target));
            prop_assert_eq!(first.is_none(), !source && !target);
            if let Some(direction) = first {
                prop_assert_eq!(direction == TransferDirection::Recovered, source && target);
            }
        }
    }

    #[test]
    fn test_fee_for_size() {
        let (wei, _) = fixtures::eth();
        let eth_basis = TransferFeeBasis::Ethereum {
            gas_price: Amount::from_base(2_000_000_000, &wei),
            gas_limit: 21_000,
        };
        assert_eq!(eth_basis.fee_for_size(0), Some(42_000_000_000_000));

        let btc_basis = TransferFeeBasis::Bitcoin { fee_per_kb: 1_000 };
        assert_eq!(btc_basis.fee_for_size(226), Some(226));
    }

    #[test]
    fn test_hash_hex() {
        let hash = TransferHash::from_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(hash.as_str(), "0xdeadbeef");
    }
}
