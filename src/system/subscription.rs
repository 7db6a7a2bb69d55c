//! Subscribed-wallets hook
//!
//! A remote query service may push account activity for the addresses it is told about. The
//! system hands it a fresh snapshot whenever wallet membership changes the set.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::manager::WalletManager;
use crate::network::{Account, Address};

/// Every wallet address of the account, grouped by currency code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscribedWallets {
    pub id: String,
    pub currencies: BTreeMap<String, Vec<Address>>,
}

impl SubscribedWallets {
    pub(crate) fn collect(account: &Account, managers: &[Arc<WalletManager>]) -> Self {
        let mut currencies: BTreeMap<String, Vec<Address>> = BTreeMap::new();
        for manager in managers {
            for wallet in manager.wallets() {
                let addresses = currencies.entry(wallet.name().to_string()).or_default();
                if let Some(address) = wallet.source() {
                    addresses.push(address);
                }
            }
        }
        for addresses in currencies.values_mut() {
            addresses.sort();
            addresses.dedup();
        }
        Self {
            id: account.uids().to_string(),
            currencies,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Receives the subscribed-wallets snapshot
pub trait WalletSubscriber: Send + Sync {
    fn update_subscribed_wallets(&self, wallets: &SubscribedWallets);
}
