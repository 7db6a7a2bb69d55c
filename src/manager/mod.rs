//! Wallet managers: the wallets of one account on one network
//!
//! A manager owns its wallets, tracks connectivity, and turns block height changes into
//! per-transfer confirmation events.

mod confirmations;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::amount::{Currency, Unit};
use crate::engine::{ManagerHandle, WalletEngine, WalletHandle};
use crate::error::{Error, Result};
use crate::network::{Account, Network};
use crate::system::{Announcement, System, SystemShared};
use crate::transfer::{Transfer, TransferEvent};
use crate::wallet::{Wallet, WalletEvent, WalletState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletManagerState {
    Created,
    Disconnected,
    Connected,
    Syncing,
    Deleted,
}

impl fmt::Display for WalletManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Syncing => "syncing",
            Self::Deleted => "deleted",
        })
    }
}

/// How a manager splits work between a hosted API and the peer-to-peer network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletManagerMode {
    ApiOnly,
    ApiWithP2pSubmit,
    P2pWithApiSync,
    P2pOnly,
}

impl fmt::Display for WalletManagerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ApiOnly => "api_only",
            Self::ApiWithP2pSubmit => "api_with_p2p_submit",
            Self::P2pWithApiSync => "p2p_with_api_sync",
            Self::P2pOnly => "p2p_only",
        })
    }
}

#[derive(Debug, Clone)]
pub enum WalletManagerEvent {
    Created,
    Changed {
        old: WalletManagerState,
        new: WalletManagerState,
    },
    Deleted,
    WalletAdded { wallet: Arc<Wallet> },
    WalletChanged { wallet: Arc<Wallet> },
    WalletDeleted { wallet: Arc<Wallet> },
    SyncStarted,
    SyncProgress { percent: f64 },
    SyncEnded { error: Option<String> },
    BlockUpdated { height: u64 },
}

impl fmt::Display for WalletManagerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Changed { old, new } => write!(f, "changed({} -> {})", old, new),
            Self::Deleted => f.write_str("deleted"),
            Self::WalletAdded { wallet } => write!(f, "wallet_added({})", wallet.handle()),
            Self::WalletChanged { wallet } => write!(f, "wallet_changed({})", wallet.handle()),
            Self::WalletDeleted { wallet } => write!(f, "wallet_deleted({})", wallet.handle()),
            Self::SyncStarted => f.write_str("sync_started"),
            Self::SyncProgress { percent } => write!(f, "sync_progress({:.0}%)", percent),
            Self::SyncEnded { error: None } => f.write_str("sync_ended"),
            Self::SyncEnded { error: Some(e) } => write!(f, "sync_ended({})", e),
            Self::BlockUpdated { height } => write!(f, "block_updated({})", height),
        }
    }
}

pub struct WalletManager {
    handle: ManagerHandle,
    system: Weak<SystemShared>,
    engine: Arc<dyn WalletEngine>,
    account: Account,
    network: Arc<Network>,
    mode: WalletManagerMode,
    path: String,
    base_unit: Unit,
    default_unit: Unit,
    state: RwLock<WalletManagerState>,
    wallets: RwLock<Vec<Arc<Wallet>>>,
    primary: OnceLock<WalletHandle>,
}

impl WalletManager {
    pub(crate) fn new(
        system: &System,
        handle: ManagerHandle,
        network: Arc<Network>,
        mode: WalletManagerMode,
    ) -> Result<Self> {
        let currency = network.currency();
        let base_unit = network
            .base_unit_for(currency)
            .cloned()
            .ok_or_else(|| Error::UnitNotFound {
                currency: currency.code().to_string(),
                unit: "base".to_string(),
            })?;
        let default_unit = network
            .default_unit_for(currency)
            .cloned()
            .ok_or_else(|| Error::UnitNotFound {
                currency: currency.code().to_string(),
                unit: "default".to_string(),
            })?;

        Ok(Self {
            handle,
            system: system.downgrade(),
            engine: system.engine().clone(),
            account: system.account().clone(),
            network,
            mode,
            path: system.path().to_string(),
            base_unit,
            default_unit,
            state: RwLock::new(WalletManagerState::Created),
            wallets: RwLock::new(Vec::new()),
            primary: OnceLock::new(),
        })
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle
    }

    /// Owning system, if it is still alive
    pub fn system(&self) -> Option<System> {
        System::upgrade(&self.system)
    }

    pub(crate) fn engine(&self) -> &Arc<dyn WalletEngine> {
        &self.engine
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn mode(&self) -> WalletManagerMode {
        self.mode
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn currency(&self) -> &Currency {
        self.network.currency()
    }

    /// Base unit of the network currency; fees are charged in it
    pub fn fee_unit(&self) -> &Unit {
        &self.base_unit
    }

    pub fn default_unit(&self) -> &Unit {
        &self.default_unit
    }

    pub fn height(&self) -> u64 {
        self.network.height()
    }

    pub fn state(&self) -> WalletManagerState {
        *self.state.read()
    }

    /// Connected or syncing
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            WalletManagerState::Connected | WalletManagerState::Syncing
        )
    }

    /// Ask the engine to connect; a no-op while already connected or syncing
    pub fn connect(&self) {
        if self.is_active() {
            debug!("{} already connected", self.handle);
            return;
        }
        info!("Connecting {} on {}", self.handle, self.network);
        self.engine.connect(self.handle);
    }

    /// Ask the engine to disconnect; a no-op while not connected
    pub fn disconnect(&self) {
        if !self.is_active() {
            debug!("{} already disconnected", self.handle);
            return;
        }
        info!("Disconnecting {}", self.handle);
        self.engine.disconnect(self.handle);
    }

    pub fn sync(&self) {
        info!("Syncing {}", self.handle);
        self.engine.sync(self.handle);
    }

    /// Sign `transfer` with the key derived from `paper_key` and broadcast it. The outcome
    /// arrives later as transfer state changes.
    ///
    /// # Panics
    /// When `transfer` is not held by one of this manager's wallets.
    pub fn submit(&self, transfer: &Transfer, paper_key: &str) {
        let held = self
            .wallet_by_handle(transfer.wallet_handle())
            .map(|wallet| wallet.has_transfer(transfer))
            .unwrap_or(false);
        assert!(
            held,
            "{} is not held by any wallet of {}",
            transfer.handle(),
            self.handle
        );

        info!("Submitting {} via {}", transfer.handle(), self.handle);
        self.engine.submit(
            self.handle,
            transfer.wallet_handle(),
            transfer.handle(),
            paper_key,
        );
    }

    /// Wallet for the network currency, created on first use
    pub fn primary_wallet(self: &Arc<Self>) -> Option<Arc<Wallet>> {
        if let Some(handle) = self.primary.get() {
            return self.wallet_by_handle(*handle);
        }
        let handle = self.engine.primary_wallet(self.handle)?;
        let wallet = self.ensure_wallet(handle)?;
        let _ = self.primary.set(handle);
        Some(wallet)
    }

    /// Snapshot of the wallets in the order they were added
    pub fn wallets(&self) -> Vec<Arc<Wallet>> {
        self.wallets.read().clone()
    }

    pub fn wallet_by_handle(&self, handle: WalletHandle) -> Option<Arc<Wallet>> {
        self.wallets
            .read()
            .iter()
            .find(|w| w.handle() == handle)
            .cloned()
    }

    pub fn wallet_for_currency(&self, currency: &Currency) -> Option<Arc<Wallet>> {
        self.wallets
            .read()
            .iter()
            .find(|w| w.currency() == currency)
            .cloned()
    }

    pub fn has_wallet(&self, wallet: &Wallet) -> bool {
        self.wallet_by_handle(wallet.handle()).is_some()
    }

    /// The wallet for an engine handle, built and added if not yet known
    pub(crate) fn ensure_wallet(self: &Arc<Self>, handle: WalletHandle) -> Option<Arc<Wallet>> {
        if let Some(wallet) = self.wallet_by_handle(handle) {
            return Some(wallet);
        }
        let currency_uids = self.engine.wallet_currency(handle)?;
        let Some(currency) = self.network.currency_by_uids(&currency_uids) else {
            warn!("{} has unknown currency {}", handle, currency_uids);
            return None;
        };
        let unit = self.network.default_unit_for(currency)?.clone();
        let wallet = Arc::new(Wallet::new(handle, self, unit));
        self.add_wallet(&wallet);
        self.wallet_by_handle(handle)
    }

    /// Add `wallet`, announcing `wallet_added` then the wallet's `created`.
    ///
    /// Adding a wallet already held does nothing and returns `false`.
    ///
    /// # Panics
    /// When `wallet` was built for another manager.
    pub fn add_wallet(self: &Arc<Self>, wallet: &Arc<Wallet>) -> bool {
        assert_eq!(
            wallet.manager_handle(),
            self.handle,
            "{} belongs to {}, not {}",
            wallet.handle(),
            wallet.manager_handle(),
            self.handle
        );
        let Some(system) = self.system() else {
            return false;
        };
        let _exclusive = system.exclusive();

        {
            let mut wallets = self.wallets.write();
            if wallets.iter().any(|w| w.handle() == wallet.handle()) {
                return false;
            }
            wallets.push(wallet.clone());
        }
        info!("{} added {}", self.handle, wallet);

        system.announce(vec![
            Announcement::manager(
                self,
                WalletManagerEvent::WalletAdded {
                    wallet: wallet.clone(),
                },
            ),
            Announcement::wallet(self, wallet, WalletEvent::Created),
        ]);
        system.update_subscribed_wallets();
        true
    }

    /// Remove `wallet`, moving it to `deleted` and announcing the wallet's `deleted` then
    /// `wallet_deleted`.
    ///
    /// Removing a wallet not held does nothing and returns `false`.
    pub fn remove_wallet(self: &Arc<Self>, wallet: &Arc<Wallet>) -> bool {
        let Some(system) = self.system() else {
            return false;
        };
        let _exclusive = system.exclusive();

        let removed = {
            let mut wallets = self.wallets.write();
            let before = wallets.len();
            wallets.retain(|w| w.handle() != wallet.handle());
            wallets.len() != before
        };
        if !removed {
            return false;
        }
        info!("{} removed {}", self.handle, wallet);

        let mut announcements = wallet.set_state(WalletState::Deleted);
        announcements.push(Announcement::manager(
            self,
            WalletManagerEvent::WalletDeleted {
                wallet: wallet.clone(),
            },
        ));
        system.announce(announcements);
        system.update_subscribed_wallets();
        true
    }

    /// Record a new chain height: announce `block_updated`, then a confirmation event for
    /// every transfer whose count changed, all as one update
    pub fn update_height(self: &Arc<Self>, height: u64) {
        let Some(system) = self.system() else {
            return;
        };
        let _exclusive = system.exclusive();

        let old = self.network.set_height(height);
        if old == height {
            return;
        }
        debug!("{} height {} -> {}", self.handle, old, height);

        let mut announcements = vec![Announcement::manager(
            self,
            WalletManagerEvent::BlockUpdated { height },
        )];
        announcements.extend(
            confirmations::plan(&self.wallets(), old, height)
                .into_iter()
                .map(|update| {
                    Announcement::transfer(
                        self,
                        &update.wallet,
                        &update.transfer,
                        TransferEvent::Confirmation {
                            count: update.count,
                        },
                    )
                }),
        );
        system.announce(announcements);
    }

    /// Write a new state and announce `changed`; `deleted` follows a move into deleted
    pub(crate) fn set_state(self: &Arc<Self>, new: WalletManagerState) {
        let old = {
            let mut state = self.state.write();
            if *state == new || *state == WalletManagerState::Deleted {
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        info!("{} state {} -> {}", self.handle, old, new);

        let mut announcements = vec![Announcement::manager(
            self,
            WalletManagerEvent::Changed { old, new },
        )];
        if new == WalletManagerState::Deleted {
            announcements.push(Announcement::manager(self, WalletManagerEvent::Deleted));
        }
        self.announce_all(announcements);
    }

    /// Announce an event that carries no local state change
    pub(crate) fn announce(self: &Arc<Self>, event: WalletManagerEvent) {
        self.announce_all(vec![Announcement::manager(self, event)]);
    }

    fn announce_all(&self, announcements: Vec<Announcement>) {
        if let Some(system) = self.system() {
            let _exclusive = system.exclusive();
            system.announce(announcements);
        }
    }
}

impl PartialEq for WalletManager {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for WalletManager {}

impl Hash for WalletManager {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl fmt::Debug for WalletManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletManager")
            .field("handle", &self.handle)
            .field("network", &self.network.uids())
            .field("mode", &self.mode)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl fmt::Display for WalletManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.handle, self.network.name())
    }
}
