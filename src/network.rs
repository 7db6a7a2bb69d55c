//! Networks, addresses and accounts

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::{Currency, Unit};

/// A textual on-chain address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The user's account: one identity across every network
#[derive(Debug, Clone)]
pub struct Account {
    uids: String,
    timestamp: DateTime<Utc>,
}

impl Account {
    pub fn new(uids: &str) -> Self {
        Self {
            uids: uids.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Account with a freshly generated identifier
    pub fn generate() -> Self {
        Self::new(&Uuid::new_v4().to_string())
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    /// Earliest time the account could have transacted; bounds sync depth
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Units a network knows for one of its currencies
#[derive(Debug, Clone)]
pub struct NetworkAssociation {
    pub base_unit: Unit,
    pub default_unit: Unit,
    pub units: Vec<Unit>,
}

/// A blockchain network and its currencies
#[derive(Debug)]
pub struct Network {
    uids: String,
    name: String,
    is_mainnet: bool,
    currency: Currency,
    height: AtomicU64,
    confirmations_until_final: u32,
    associations: HashMap<Currency, NetworkAssociation>,
}

impl Network {
    pub fn new(
        uids: &str,
        name: &str,
        is_mainnet: bool,
        currency: Currency,
        height: u64,
        confirmations_until_final: u32,
    ) -> Self {
        Self {
            uids: uids.to_string(),
            name: name.to_string(),
            is_mainnet,
            currency,
            height: AtomicU64::new(height),
            confirmations_until_final,
            associations: HashMap::new(),
        }
    }

    /// Register the units of `currency` on this network
    pub fn with_association(mut self, currency: Currency, association: NetworkAssociation) -> Self {
        self.associations.insert(currency, association);
        self
    }

    pub fn uids(&self) -> &str {
        &self.uids
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_mainnet(&self) -> bool {
        self.is_mainnet
    }

    /// The network's native currency
    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn currencies(&self) -> impl Iterator<Item = &Currency> {
        self.associations.keys()
    }

    pub fn has_currency(&self, currency: &Currency) -> bool {
        self.associations.contains_key(currency)
    }

    pub fn currency_by_uids(&self, uids: &str) -> Option<&Currency> {
        self.associations.keys().find(|c| c.uids() == uids)
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    /// Store a new height, returning the previous one
    pub(crate) fn set_height(&self, height: u64) -> u64 {
        self.height.swap(height, Ordering::AcqRel)
    }

    pub fn confirmations_until_final(&self) -> u32 {
        self.confirmations_until_final
    }

    pub fn base_unit_for(&self, currency: &Currency) -> Option<&Unit> {
        self.associations.get(currency).map(|a| &a.base_unit)
    }

    pub fn default_unit_for(&self, currency: &Currency) -> Option<&Unit> {
        self.associations.get(currency).map(|a| &a.default_unit)
    }

    pub fn units_for(&self, currency: &Currency) -> Option<&[Unit]> {
        self.associations.get(currency).map(|a| a.units.as_slice())
    }

    pub fn has_unit_for(&self, currency: &Currency, unit: &Unit) -> bool {
        self.units_for(currency)
            .map(|units| units.contains(unit))
            .unwrap_or(false)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uids)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::amount::fixtures;

    pub fn bitcoin() -> Network {
        let (sat, btc) = fixtures::btc();
        let currency = sat.currency().clone();
        Network::new("bitcoin-mainnet", "Bitcoin", true, currency.clone(), 100, 6).with_association(
            currency,
            NetworkAssociation {
                base_unit: sat.clone(),
                default_unit: btc.clone(),
                units: vec![sat, btc],
            },
        )
    }

    pub fn ethereum() -> Network {
        let (wei, eth) = fixtures::eth();
        let currency = wei.currency().clone();
        Network::new("ethereum-mainnet", "Ethereum", true, currency.clone(), 1_000, 6)
            .with_association(
                currency,
                NetworkAssociation {
                    base_unit: wei.clone(),
                    default_unit: eth.clone(),
                    units: vec![wei, eth],
                },
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_units() {
        let network = fixtures::bitcoin();
        let currency = network.currency().clone();
        assert_eq!(network.base_unit_for(&currency).unwrap().decimals(), 0);
        assert_eq!(network.default_unit_for(&currency).unwrap().decimals(), 8);
        assert!(network.has_currency(&currency));
        assert_eq!(
            network.currency_by_uids("bitcoin-mainnet:__native__"),
            Some(&currency)
        );
    }

    #[test]
    fn test_height_swap() {
        let network = fixtures::bitcoin();
        assert_eq!(network.set_height(105), 100);
        assert_eq!(network.height(), 105);
    }
}
