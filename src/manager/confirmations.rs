//! Confirmation fan-out for block height changes
//!
//! Planning is a pure pass over a snapshot of wallets: it reports which transfers gain or lose
//! confirmations between two heights, and the manager announces the plan in one update.

use std::sync::Arc;

use crate::transfer::Transfer;
use crate::wallet::Wallet;

pub(crate) struct ConfirmationUpdate {
    pub wallet: Arc<Wallet>,
    pub transfer: Arc<Transfer>,
    pub count: u64,
}

/// Confirmation count at `new_height` for a transfer included in `block`, if it differs from
/// the count at `old_height`
pub(crate) fn changed_count(block: Option<u64>, old_height: u64, new_height: u64) -> Option<u64> {
    let at = |height: u64| block.filter(|b| height >= *b).map(|b| 1 + height - b);
    let new = at(new_height)?;
    (at(old_height) != Some(new)).then_some(new)
}

/// Every transfer, across `wallets`, whose confirmation count changes between the heights
pub(crate) fn plan(
    wallets: &[Arc<Wallet>],
    old_height: u64,
    new_height: u64,
) -> Vec<ConfirmationUpdate> {
    let mut updates = Vec::new();
    for wallet in wallets {
        for transfer in wallet.transfers() {
            let block = transfer.state().confirmation().map(|c| c.block_number);
            if let Some(count) = changed_count(block, old_height, new_height) {
                updates.push(ConfirmationUpdate {
                    wallet: wallet.clone(),
                    transfer,
                    count,
                });
            }
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_changed_count() {
        assert_eq!(changed_count(Some(100), 100, 105), Some(6));
        assert_eq!(changed_count(Some(103), 100, 105), Some(3));
        assert_eq!(changed_count(Some(106), 100, 105), None);
        assert_eq!(changed_count(None, 100, 105), None);
        assert_eq!(changed_count(Some(100), 105, 105), None);
    }

    proptest! {
        #[test]
        fn raising_height_changes_exactly_the_confirmed(
            blocks in proptest::collection::vec(proptest::option::of(0u64..200), 0..32),
            old in 0u64..200,
            delta in 1u64..50,
        ) {
            let new = old + delta;
            let changed = blocks
                .iter()
                .filter(|b| changed_count(**b, old, new).is_some())
                .count();
            let expected = blocks
                .iter()
                .filter(|b| matches!(b, Some(block) if *block <= new))
                .count();
            prop_assert_eq!(changed, expected);

            for block in blocks.iter().flatten() {
                if let Some(count) = changed_count(Some(*block), old, new) {
                    prop_assert_eq!(count, 1 + new - block);
                }
            }
        }
    }
}
