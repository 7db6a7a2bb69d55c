//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::amount::{Currency, Unit, MAX_DECIMALS};
use crate::manager::WalletManagerMode;
use crate::network::{Network, NetworkAssociation};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    /// Account identifier; a fresh one is generated when unset
    #[serde(default)]
    pub account_uids: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            account_uids: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            drop_policy: default_drop_policy(),
        }
    }
}

/// What the event queue does when listeners fall behind
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Drop newest incoming events
    Newest,
    /// Block the announcing thread until space is available
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_mode")]
    pub default_mode: WalletManagerMode,
    #[serde(default = "default_true")]
    pub connect_on_start: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            connect_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: default_log_filter(),
        }
    }
}

/// One network with its native currency
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub uids: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_mainnet: bool,
    pub currency_code: String,
    pub currency_name: String,
    /// Symbol of the indivisible unit
    pub base_unit: String,
    /// Symbol of the display unit
    pub default_unit: String,
    pub decimals: u8,
    #[serde(default)]
    pub height: u64,
    #[serde(default = "default_confirmations_until_final")]
    pub confirmations_until_final: u32,
}

impl NetworkConfig {
    pub fn build(&self) -> Network {
        let currency = Currency::new(
            &format!("{}:__native__", self.uids),
            &self.currency_name,
            &self.currency_code,
            "native",
            None,
        );
        let base = Unit::base(
            currency.clone(),
            &format!("{}-{}", self.currency_code, self.base_unit.to_lowercase()),
            &self.base_unit,
            &self.base_unit,
        );
        let default = Unit::derived(
            &base,
            &format!("{}-{}", self.currency_code, self.default_unit.to_lowercase()),
            &self.default_unit,
            &self.default_unit,
            self.decimals,
        );
        Network::new(
            &self.uids,
            &self.name,
            self.is_mainnet,
            currency.clone(),
            self.height,
            self.confirmations_until_final,
        )
        .with_association(
            currency,
            NetworkAssociation {
                base_unit: base.clone(),
                default_unit: default.clone(),
                units: vec![base, default],
            },
        )
    }
}

// Default value functions
fn default_storage_path() -> String {
    std::env::var("WALLETKIT_STORAGE").unwrap_or_else(|_| "./data".into())
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_drop_policy() -> DropPolicy {
    DropPolicy::Block
}

fn default_mode() -> WalletManagerMode {
    WalletManagerMode::ApiOnly
}

fn default_log_filter() -> String {
    "walletkit=info".into()
}

fn default_confirmations_until_final() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_networks() -> Vec<NetworkConfig> {
    vec![
        NetworkConfig {
            uids: "bitcoin-mainnet".into(),
            name: "Bitcoin".into(),
            is_mainnet: true,
            currency_code: "btc".into(),
            currency_name: "Bitcoin".into(),
            base_unit: "SAT".into(),
            default_unit: "BTC".into(),
            decimals: 8,
            height: 0,
            confirmations_until_final: 6,
        },
        NetworkConfig {
            uids: "ethereum-mainnet".into(),
            name: "Ethereum".into(),
            is_mainnet: true,
            currency_code: "eth".into(),
            currency_name: "Ethereum".into(),
            base_unit: "WEI".into(),
            default_unit: "ETH".into(),
            decimals: 18,
            height: 0,
            confirmations_until_final: 6,
        },
    ]
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("system.storage_path", default_storage_path())?
            .set_default("dispatch.channel_capacity", default_channel_capacity() as i64)?
            .set_default("dispatch.drop_policy", "block")?
            .set_default("manager.default_mode", "api_only")?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix WALLETKIT_)
            .add_source(
                config::Environment::with_prefix("WALLETKIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            anyhow::bail!("At least one network must be configured");
        }

        let mut seen = HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.uids.as_str()) {
                anyhow::bail!("Duplicate network uids: {}", network.uids);
            }
            if network.decimals > MAX_DECIMALS {
                anyhow::bail!(
                    "Network {} has {} decimals, at most {} allowed",
                    network.uids,
                    network.decimals,
                    MAX_DECIMALS
                );
            }
        }

        if self.dispatch.channel_capacity == 0 {
            anyhow::bail!("dispatch.channel_capacity must be positive");
        }

        if self.dispatch.drop_policy == DropPolicy::Newest {
            tracing::warn!("Dispatch drop_policy is 'newest' - listeners may miss events");
        }

        Ok(())
    }

    /// Human-readable view of the effective configuration
    pub fn summary(&self) -> String {
        let networks: Vec<String> = self
            .networks
            .iter()
            .map(|n| {
                format!(
                    "    {} ({}): {} {} / {} ({} decimals), final after {}",
                    n.name,
                    n.uids,
                    n.currency_code,
                    n.base_unit,
                    n.default_unit,
                    n.decimals,
                    n.confirmations_until_final
                )
            })
            .collect();
        format!(
            r#"Configuration:
  System:
    storage_path: {}
    account: {}
  Dispatch:
    channel_capacity: {}
    drop_policy: {:?}
  Manager:
    default_mode: {}
    connect_on_start: {}
  Logging:
    json: {}
    filter: {}
  Networks:
{}
"#,
            self.system.storage_path,
            self.system.account_uids.as_deref().unwrap_or("(generated)"),
            self.dispatch.channel_capacity,
            self.dispatch.drop_policy,
            self.manager.default_mode,
            self.manager.connect_on_start,
            self.logging.json,
            self.logging.filter,
            networks.join("\n"),
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            dispatch: DispatchConfig::default(),
            manager: ManagerConfig::default(),
            logging: LoggingConfig::default(),
            networks: default_networks(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dispatch.channel_capacity, 1024);
        assert_eq!(config.dispatch.drop_policy, DropPolicy::Block);
        assert_eq!(config.manager.default_mode, WalletManagerMode::ApiOnly);
        assert_eq!(config.networks.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_drop_policy_deserialize() {
        let json = r#""newest""#;
        let policy: DropPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy, DropPolicy::Newest);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("walletkit.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[system]
account_uids = "acct-1"

[dispatch]
channel_capacity = 8
drop_policy = "newest"

[manager]
default_mode = "p2p_only"

[[networks]]
uids = "bitcoin-testnet"
name = "Bitcoin Testnet"
is_mainnet = false
currency_code = "btc"
currency_name = "Bitcoin"
base_unit = "SAT"
default_unit = "BTC"
decimals = 8
height = 42
"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.system.account_uids.as_deref(), Some("acct-1"));
        assert_eq!(config.dispatch.channel_capacity, 8);
        assert_eq!(config.dispatch.drop_policy, DropPolicy::Newest);
        assert_eq!(config.manager.default_mode, WalletManagerMode::P2pOnly);
        assert_eq!(config.networks.len(), 1);

        let network = config.networks[0].build();
        assert!(!network.is_mainnet());
        assert_eq!(network.height(), 42);
        assert_eq!(network.confirmations_until_final(), 6);
        let currency = network.currency();
        assert_eq!(network.base_unit_for(currency).unwrap().symbol(), "SAT");
        assert_eq!(network.default_unit_for(currency).unwrap().decimals(), 8);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.manager.default_mode, WalletManagerMode::ApiOnly);
    }

    #[test]
    fn test_validate_rejects_bad_networks() {
        let mut config = Config::default();
        config.networks.push(config.networks[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.networks[1].decimals = MAX_DECIMALS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.networks.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dispatch.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_lists_networks() {
        let summary = Config::default().summary();
        assert!(summary.contains("bitcoin-mainnet"));
        assert!(summary.contains("ethereum-mainnet"));
        assert!(summary.contains("(generated)"));
    }
}
