//! The system: registry of networks and wallet managers for one account
//!
//! Every mutation of manager, wallet or transfer membership and state happens under the
//! system's exclusion lock, and the events it produces are announced before the lock is
//! released. Engine callbacks are queued on an unbounded channel and applied one at a time,
//! either synchronously with [`System::process_pending`] or from a task running
//! [`System::run`].

mod dispatch;
mod listener;
mod subscription;
#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{DispatchingListener, DropPolicy};
pub use listener::{
    Announcement, SystemListener, TransferListener, WalletListener, WalletManagerListener,
};
pub use subscription::{SubscribedWallets, WalletSubscriber};

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::amount::Amount;
use crate::config::Config;
use crate::engine::{
    EngineEvent, EngineEventSink, ManagerCallback, ManagerHandle, TransferCallback,
    WalletCallback, WalletEngine, WalletHandle,
};
use crate::error::{Error, Result};
use crate::manager::{WalletManager, WalletManagerEvent, WalletManagerMode, WalletManagerState};
use crate::network::{Account, Network};
use crate::transfer::{Transfer, TransferEvent, TransferState};
use crate::wallet::{Wallet, WalletEvent};

#[derive(Debug, Clone)]
pub enum SystemEvent {
    Created,
    NetworkAdded { network: Arc<Network> },
    ManagerAdded { manager: Arc<WalletManager> },
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::NetworkAdded { network } => write!(f, "network_added({})", network.uids()),
            Self::ManagerAdded { manager } => write!(f, "manager_added({})", manager.handle()),
        }
    }
}

pub(crate) struct SystemShared {
    account: Account,
    path: String,
    engine: Arc<dyn WalletEngine>,
    listener: Weak<dyn SystemListener>,
    subscriber: Option<Arc<dyn WalletSubscriber>>,
    networks: RwLock<Vec<Arc<Network>>>,
    managers: DashMap<ManagerHandle, Arc<WalletManager>>,
    exclusion: ReentrantMutex<()>,
    events_tx: async_channel::Sender<EngineEvent>,
    events_rx: async_channel::Receiver<EngineEvent>,
    subscribed: Mutex<Option<SubscribedWallets>>,
}

/// Cheap handle to a shared system
#[derive(Clone)]
pub struct System {
    shared: Arc<SystemShared>,
}

impl System {
    /// Create a system and announce `created`.
    ///
    /// Only a weak reference to `listener` is kept; events stop once the caller drops it.
    pub fn new<L: SystemListener + 'static>(
        account: Account,
        path: &str,
        engine: Arc<dyn WalletEngine>,
        listener: &Arc<L>,
        subscriber: Option<Arc<dyn WalletSubscriber>>,
    ) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        let listener: Weak<dyn SystemListener> =
            Arc::downgrade(listener) as Weak<dyn SystemListener>;
        let system = Self {
            shared: Arc::new(SystemShared {
                account,
                path: path.to_string(),
                engine,
                listener,
                subscriber,
                networks: RwLock::new(Vec::new()),
                managers: DashMap::new(),
                exclusion: ReentrantMutex::new(()),
                events_tx,
                events_rx,
                subscribed: Mutex::new(None),
            }),
        };
        info!(
            "System created for account {} at {}",
            system.account().uids(),
            system.path()
        );
        system.announce(vec![Announcement::System {
            event: SystemEvent::Created,
        }]);
        system
    }

    /// Create a system with the configured account, storage path and networks
    pub fn from_config<L: SystemListener + 'static>(
        config: &Config,
        engine: Arc<dyn WalletEngine>,
        listener: &Arc<L>,
        subscriber: Option<Arc<dyn WalletSubscriber>>,
    ) -> Self {
        let account = match config.system.account_uids.as_deref() {
            Some(uids) => Account::new(uids),
            None => Account::generate(),
        };
        let system = Self::new(
            account,
            &config.system.storage_path,
            engine,
            listener,
            subscriber,
        );
        for network in &config.networks {
            system.add_network(Arc::new(network.build()));
        }
        system
    }

    pub(crate) fn upgrade(shared: &Weak<SystemShared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    pub(crate) fn downgrade(&self) -> Weak<SystemShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn account(&self) -> &Account {
        &self.shared.account
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub(crate) fn engine(&self) -> &Arc<dyn WalletEngine> {
        &self.shared.engine
    }

    /// Sink handed to the engine for its callbacks
    pub fn event_sink(&self) -> EngineEventSink {
        EngineEventSink::new(self.shared.events_tx.clone())
    }

    /// Engine callbacks queued and not yet applied
    pub fn pending_events(&self) -> usize {
        self.shared.events_rx.len()
    }

    pub(crate) fn exclusive(&self) -> ReentrantMutexGuard<'_, ()> {
        self.shared.exclusion.lock()
    }

    /// Deliver announcements in order to the listener, if it is still alive
    pub(crate) fn announce(&self, announcements: Vec<Announcement>) {
        let listener = self.shared.listener.upgrade();
        for announcement in announcements {
            debug!("Announcing {}", announcement);
            if let Some(listener) = listener.as_ref() {
                announcement.deliver(self, listener.as_ref());
            }
        }
    }

    /// Register `network`, announcing `network_added`. Known networks are ignored.
    pub fn add_network(&self, network: Arc<Network>) -> bool {
        let _exclusive = self.exclusive();
        {
            let mut networks = self.shared.networks.write();
            if networks.iter().any(|n| n.uids() == network.uids()) {
                return false;
            }
            networks.push(network.clone());
        }
        info!("Added network {}", network);
        self.announce(vec![Announcement::System {
            event: SystemEvent::NetworkAdded { network },
        }]);
        true
    }

    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.shared.networks.read().clone()
    }

    pub fn network_by_uids(&self, uids: &str) -> Option<Arc<Network>> {
        self.shared
            .networks
            .read()
            .iter()
            .find(|n| n.uids() == uids)
            .cloned()
    }

    /// Create the manager for `network`, or return the existing one
    pub fn create_wallet_manager(
        &self,
        network: &Arc<Network>,
        mode: WalletManagerMode,
    ) -> Result<Arc<WalletManager>> {
        if self.network_by_uids(network.uids()).is_none() {
            return Err(Error::NetworkNotFound(network.uids().to_string()));
        }
        if let Some(existing) = self.manager_for_network(network) {
            return Ok(existing);
        }

        let handle = self.shared.engine.create_manager(
            self.event_sink(),
            &self.shared.account,
            network,
            mode,
            &self.shared.path,
        )?;
        let manager = Arc::new(WalletManager::new(self, handle, network.clone(), mode)?);
        self.add_manager(&manager);
        Ok(manager)
    }

    /// Register `manager`, announcing `manager_added` then the manager's `created`.
    ///
    /// Adding a manager already held does nothing and returns `false`.
    pub fn add_manager(&self, manager: &Arc<WalletManager>) -> bool {
        let _exclusive = self.exclusive();
        if self.shared.managers.contains_key(&manager.handle()) {
            return false;
        }
        self.shared
            .managers
            .insert(manager.handle(), manager.clone());
        info!("Added wallet manager {} ({})", manager, manager.mode());

        self.announce(vec![
            Announcement::System {
                event: SystemEvent::ManagerAdded {
                    manager: manager.clone(),
                },
            },
            Announcement::manager(manager, WalletManagerEvent::Created),
        ]);
        true
    }

    /// Snapshot of the managers, ordered by handle
    pub fn managers(&self) -> Vec<Arc<WalletManager>> {
        let mut managers: Vec<_> = self
            .shared
            .managers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        managers.sort_by_key(|m| m.handle());
        managers
    }

    pub fn manager_by_handle(&self, handle: ManagerHandle) -> Option<Arc<WalletManager>> {
        self.shared
            .managers
            .get(&handle)
            .map(|entry| entry.value().clone())
    }

    pub fn manager_for_network(&self, network: &Network) -> Option<Arc<WalletManager>> {
        self.managers()
            .into_iter()
            .find(|m| m.network().uids() == network.uids())
    }

    /// Every wallet of every manager
    pub fn wallets(&self) -> Vec<Arc<Wallet>> {
        self.managers()
            .iter()
            .flat_map(|m| m.wallets())
            .collect()
    }

    /// Connect every manager
    pub fn start(&self) {
        info!("Starting system");
        for manager in self.managers() {
            manager.connect();
        }
    }

    /// Disconnect every manager
    pub fn stop(&self) {
        info!("Stopping system");
        for manager in self.managers() {
            manager.disconnect();
        }
    }

    /// Push the current wallet addresses to the subscriber if they changed since the last push
    pub fn update_subscribed_wallets(&self) -> bool {
        let Some(subscriber) = self.shared.subscriber.as_ref() else {
            return false;
        };
        let snapshot = SubscribedWallets::collect(&self.shared.account, &self.managers());
        {
            let mut last = self.shared.subscribed.lock();
            if last.as_ref() == Some(&snapshot) {
                return false;
            }
            *last = Some(snapshot.clone());
        }
        debug!(
            "Updating subscribed wallets: {} currencies",
            snapshot.currencies.len()
        );
        subscriber.update_subscribed_wallets(&snapshot);
        true
    }

    /// Apply every queued engine callback, returning how many were applied
    pub fn process_pending(&self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.shared.events_rx.try_recv() {
            self.apply(event);
            applied += 1;
        }
        applied
    }

    /// Apply engine callbacks as they arrive until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("System event loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.shared.events_rx.recv() => match event {
                    Ok(event) => self.apply(event),
                    Err(_) => break,
                },
            }
        }
        info!("System event loop stopped");
    }

    /// Apply one engine callback as a single update
    pub fn apply(&self, event: EngineEvent) {
        let _exclusive = self.exclusive();
        match event {
            EngineEvent::Manager { manager, event } => match self.manager_by_handle(manager) {
                Some(manager) => self.apply_manager(&manager, event),
                None => warn!("Missed {:?} for unknown {}", event, manager),
            },
            EngineEvent::Wallet {
                manager,
                wallet,
                event,
            } => match self.lookup_wallet(manager, wallet) {
                Some((manager, wallet)) => self.apply_wallet(&manager, &wallet, event),
                None => warn!("Missed {:?} for unknown {}", event, wallet),
            },
            EngineEvent::Transfer {
                manager,
                wallet,
                transfer,
                event,
            } => {
                let found = self
                    .lookup_wallet(manager, wallet)
                    .and_then(|(m, w)| w.transfer_by_handle(transfer).map(|t| (m, w, t)));
                match found {
                    Some((manager, wallet, transfer)) => {
                        self.apply_transfer(&manager, &wallet, &transfer, event)
                    }
                    None => warn!("Missed {:?} for unknown {}", event, transfer),
                }
            }
        }
    }

    fn lookup_wallet(
        &self,
        manager: ManagerHandle,
        wallet: WalletHandle,
    ) -> Option<(Arc<WalletManager>, Arc<Wallet>)> {
        let manager = self.manager_by_handle(manager)?;
        let wallet = manager.wallet_by_handle(wallet)?;
        Some((manager, wallet))
    }

    fn apply_manager(&self, manager: &Arc<WalletManager>, event: ManagerCallback) {
        match event {
            ManagerCallback::Changed { new } => manager.set_state(new),
            ManagerCallback::Deleted => manager.set_state(WalletManagerState::Deleted),
            ManagerCallback::WalletAdded { wallet } => {
                if manager.ensure_wallet(wallet).is_none() {
                    warn!("{} could not adopt {}", manager.handle(), wallet);
                }
            }
            ManagerCallback::WalletChanged { wallet } => match manager.wallet_by_handle(wallet) {
                Some(wallet) => manager.announce(WalletManagerEvent::WalletChanged { wallet }),
                None => warn!("Missed change of unknown {}", wallet),
            },
            ManagerCallback::WalletDeleted { wallet } => match manager.wallet_by_handle(wallet) {
                Some(wallet) => {
                    manager.remove_wallet(&wallet);
                }
                None => warn!("Missed deletion of unknown {}", wallet),
            },
            ManagerCallback::SyncStarted => manager.announce(WalletManagerEvent::SyncStarted),
            ManagerCallback::SyncProgress { percent } => {
                manager.announce(WalletManagerEvent::SyncProgress { percent })
            }
            ManagerCallback::SyncEnded { error } => {
                manager.announce(WalletManagerEvent::SyncEnded { error })
            }
            ManagerCallback::BlockHeightUpdated { height } => manager.update_height(height),
        }
    }

    fn apply_wallet(
        &self,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        event: WalletCallback,
    ) {
        match event {
            WalletCallback::Changed { new } => self.announce(wallet.set_state(new)),
            WalletCallback::Deleted => {
                manager.remove_wallet(wallet);
            }
            WalletCallback::TransferAdded { transfer } => {
                let transfer = match wallet.transfer_by_handle(transfer) {
                    Some(existing) => existing,
                    None => {
                        let created = Arc::new(Transfer::new(transfer, wallet, None));
                        wallet.add(&created);
                        created
                    }
                };
                if let Some(state) = self.shared.engine.transfer_state(transfer.handle()) {
                    self.transition(manager, wallet, &transfer, state);
                }
            }
            WalletCallback::TransferChanged { transfer } => {
                match wallet.transfer_by_handle(transfer) {
                    Some(transfer) => wallet.announce(WalletEvent::TransferChanged { transfer }),
                    None => warn!("Missed change of unknown {}", transfer),
                }
            }
            WalletCallback::TransferSubmitted { transfer, success } => {
                match wallet.transfer_by_handle(transfer) {
                    Some(transfer) => {
                        wallet.announce(WalletEvent::TransferSubmitted { transfer, success })
                    }
                    None => warn!("Missed submission of unknown {}", transfer),
                }
            }
            WalletCallback::TransferDeleted { transfer } => {
                match wallet.transfer_by_handle(transfer) {
                    Some(transfer) => {
                        wallet.remove(&transfer);
                    }
                    None => debug!("{} already gone", transfer),
                }
            }
            WalletCallback::BalanceUpdated { balance } => {
                wallet.announce(WalletEvent::BalanceUpdated {
                    amount: Amount::from_base(balance, wallet.unit()),
                })
            }
            WalletCallback::FeeBasisUpdated { fee_basis } => {
                wallet.announce(WalletEvent::FeeBasisUpdated { fee_basis })
            }
        }
    }

    fn apply_transfer(
        &self,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
        event: TransferCallback,
    ) {
        match event {
            TransferCallback::Changed { new } => self.transition(manager, wallet, transfer, new),
            TransferCallback::Deleted => {
                wallet.remove(transfer);
            }
        }
    }

    /// Move `transfer` to `new`. Transitions the lifecycle forbids are logged and dropped.
    fn transition(
        &self,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
        new: TransferState,
    ) {
        if new.is_deleted() {
            wallet.remove(transfer);
            return;
        }
        let event = match transfer.set_state(new) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!("Ignoring engine update for {}: {}", transfer.handle(), e);
                return;
            }
        };
        let newly_broadcast = matches!(
            &event,
            TransferEvent::Changed { old, new } if new.is_broadcast() && !old.is_broadcast()
        );

        let mut announcements = vec![
            Announcement::transfer(manager, wallet, transfer, event),
            Announcement::wallet(
                manager,
                wallet,
                WalletEvent::TransferChanged {
                    transfer: transfer.clone(),
                },
            ),
        ];
        if newly_broadcast {
            announcements.extend(self.supersede(manager, wallet, transfer));
        }
        self.announce(announcements);
    }

    /// Retire the transfer that `transfer` replaces or cancels, now that it is on the network
    fn supersede(
        &self,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
    ) -> Vec<Announcement> {
        let Some(supersedes) = transfer.supersedes() else {
            return Vec::new();
        };
        let Some(original) = wallet.transfer_by_handle(supersedes.original) else {
            debug!("{} superseded {} which is gone", transfer.handle(), supersedes.original);
            return Vec::new();
        };
        let state = original.state();
        if state.error().is_some() {
            debug!("{} stays {} after resubmission", original.handle(), state);
            return Vec::new();
        }
        if state.confirmation().is_some() {
            warn!(
                "{} was included before {} could supersede it",
                original.handle(),
                transfer.handle()
            );
            return Vec::new();
        }
        match original.set_state(supersedes.kind.superseded_state()) {
            Ok(Some(event)) => vec![
                Announcement::transfer(manager, wallet, &original, event),
                Announcement::wallet(
                    manager,
                    wallet,
                    WalletEvent::TransferChanged { transfer: original },
                ),
            ],
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!("{} not superseded: {}", original.handle(), e);
                Vec::new()
            }
        }
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("account", &self.shared.account.uids())
            .field("path", &self.shared.path)
            .field("managers", &self.shared.managers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{
        Fixture, RecordingListener, RecordingSubscriber, ACCOUNT_UIDS, BLOCK_TIMESTAMP,
    };
    use super::*;
    use crate::amount::fixtures as units;
    use crate::engine::simulated::SimulatedEngine;
    use crate::network::Address;
    use crate::transfer::{ReplaceOptions, TransferDirection, TransferFeeBasis, TransferSubmitError};
    use crate::wallet::WalletState;
    use pretty_assertions::assert_eq;

    fn strings(events: &[&str]) -> Vec<String> {
        events.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn test_system_announces_creation_and_networks() {
        let (fixture, recorder) = Fixture::new();
        assert_eq!(
            recorder.take(),
            strings(&[
                "system created",
                "system network_added(bitcoin-mainnet)",
                "system network_added(ethereum-mainnet)",
            ])
        );

        assert!(!fixture.system.add_network(fixture.bitcoin.clone()));
        assert!(recorder.take().is_empty());
        assert_eq!(fixture.system.networks().len(), 2);
        assert!(fixture.system.network_by_uids("ethereum-mainnet").is_some());
        assert_eq!(fixture.system.account().uids(), ACCOUNT_UIDS);
    }

    #[test]
    fn test_manager_and_primary_wallet_order() {
        let (fixture, recorder) = Fixture::new();
        recorder.take();

        let manager = fixture.bitcoin_manager();
        assert_eq!(
            recorder.take(),
            strings(&[
                "system manager_added(ManagerHandle#1)",
                "ManagerHandle#1 created",
                "ManagerHandle#1 wallet_added(WalletHandle#2)",
                "WalletHandle#2 created",
            ])
        );

        let again = fixture
            .system
            .create_wallet_manager(&fixture.bitcoin, WalletManagerMode::P2pOnly)
            .unwrap();
        assert!(Arc::ptr_eq(&manager, &again));
        assert!(!fixture.system.add_manager(&manager));
        assert!(!manager.add_wallet(&manager.primary_wallet().unwrap()));
        assert!(recorder.take().is_empty());

        let wallet = manager.primary_wallet().unwrap();
        assert_eq!(wallet.handle(), WalletHandle(2));
        assert!(Arc::ptr_eq(&wallet.manager().unwrap(), &manager));
        assert_eq!(manager.wallet_for_currency(manager.currency()), Some(wallet));
        assert_eq!(fixture.system.wallets().len(), 1);
        assert_eq!(manager.mode(), WalletManagerMode::ApiOnly);
    }

    #[test]
    fn test_manager_for_unregistered_network() {
        let (fixture, _recorder) = Fixture::new();
        let (sat, _) = units::btc();
        let testnet = Arc::new(Network::new(
            "bitcoin-testnet",
            "Bitcoin Testnet",
            false,
            sat.currency().clone(),
            0,
            6,
        ));
        let result = fixture
            .system
            .create_wallet_manager(&testnet, WalletManagerMode::ApiOnly);
        assert!(matches!(result, Err(Error::NetworkNotFound(uids)) if uids == "bitcoin-testnet"));
        assert!(fixture.system.managers().is_empty());
    }

    #[test]
    fn test_received_transfer_order() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        recorder.take();

        let transfer = fixture.fund(&wallet, 50_000);
        assert_eq!(
            recorder.take(),
            strings(&[
                "WalletHandle#2 transfer_added(TransferHandle#3)",
                "TransferHandle#3 created",
                "TransferHandle#3 changed(created -> included(block 100, index 0))",
                "WalletHandle#2 transfer_changed(TransferHandle#3)",
                "WalletHandle#2 balance_updated(0.0005 BTC)",
                "WalletHandle#2 balance_updated(0.0005 BTC)",
            ])
        );
        assert_eq!(transfer.direction(), TransferDirection::Received);
        assert_eq!(transfer.directed_amount().value(), 50_000);
        assert_eq!(transfer.confirmations(), Some(1));
        assert_eq!(transfer.fee().value(), 0);
        assert_eq!(wallet.balance().value(), 50_000);
    }

    #[test]
    fn test_send_submit_and_confirmations() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        let funding = fixture.fund(&wallet, 50_000);
        recorder.take();

        let target = SimulatedEngine::counterparty(&fixture.bitcoin, "merchant");
        let amount = Amount::from_base(10_000, wallet.fee_unit());
        let estimate = wallet.estimate_fee(&amount, None);
        let transfer = wallet.create_transfer(&target, &amount, None).unwrap();
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&[
                "WalletHandle#2 transfer_added(TransferHandle#4)",
                "TransferHandle#4 created",
            ])
        );
        assert_eq!(transfer.direction(), TransferDirection::Sent);
        assert_eq!(transfer.directed_amount().value(), -10_000);
        assert_eq!(transfer.fee(), estimate);
        assert_eq!(estimate.value(), 2_260);
        assert!(transfer.transaction_hash().is_none());

        manager.submit(&transfer, "paper key");
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&[
                "TransferHandle#4 changed(created -> signed)",
                "WalletHandle#2 transfer_changed(TransferHandle#4)",
                "TransferHandle#4 changed(signed -> submitted)",
                "WalletHandle#2 transfer_changed(TransferHandle#4)",
                "WalletHandle#2 transfer_submitted(TransferHandle#4, true)",
                "WalletHandle#2 balance_updated(0.0003774 BTC)",
            ])
        );
        assert_eq!(transfer.state(), TransferState::Submitted);
        assert!(transfer.transaction_hash().is_some());
        assert_eq!(
            wallet.transfer_by_hash(&transfer.transaction_hash().unwrap()),
            Some(transfer.clone())
        );

        assert!(fixture.engine.include(transfer.handle(), 101, 3, BLOCK_TIMESTAMP));
        fixture.engine.advance_height(manager.handle(), 102);
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&[
                "TransferHandle#4 changed(submitted -> included(block 101, index 3))",
                "WalletHandle#2 transfer_changed(TransferHandle#4)",
                "WalletHandle#2 balance_updated(0.0003774 BTC)",
                "ManagerHandle#1 block_updated(102)",
                "TransferHandle#3 confirmation(3)",
                "TransferHandle#4 confirmation(2)",
            ])
        );
        assert_eq!(funding.confirmations(), Some(3));
        assert_eq!(transfer.confirmations(), Some(2));
        assert_eq!(wallet.transfers(), vec![funding, transfer]);

        // Same height again changes nothing
        fixture.engine.advance_height(manager.handle(), 102);
        fixture.system.process_pending();
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_submit_failures() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        fixture.fund(&wallet, 50_000);
        let target = SimulatedEngine::counterparty(&fixture.bitcoin, "merchant");
        let amount = Amount::from_base(1_000, wallet.fee_unit());

        let rejected = wallet.create_transfer(&target, &amount, None).unwrap();
        fixture.system.process_pending();
        recorder.take();
        fixture.engine.fail_next_submit(TransferSubmitError::NonceTooLow);
        manager.submit(&rejected, "paper key");
        fixture.system.process_pending();

        let events = recorder.take();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], "TransferHandle#4 changed(created -> signed)");
        assert!(events[2].starts_with("TransferHandle#4 changed(signed -> errored("));
        assert_eq!(events[4], "WalletHandle#2 transfer_submitted(TransferHandle#4, false)");
        assert_eq!(rejected.state().error(), Some(TransferSubmitError::NonceTooLow));

        let unsigned = wallet.create_transfer(&target, &amount, None).unwrap();
        fixture.system.process_pending();
        manager.submit(&unsigned, "   ");
        fixture.system.process_pending();
        assert_eq!(
            unsigned.state().error(),
            Some(TransferSubmitError::InvalidSignature)
        );
        assert!(unsigned.transaction_hash().is_none());
    }

    #[test]
    fn test_network_rejection_and_fee_basis() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        fixture.fund(&wallet, 50_000);
        let target = SimulatedEngine::counterparty(&fixture.bitcoin, "merchant");
        let amount = Amount::from_base(1_000, wallet.fee_unit());

        let transfer = wallet.create_transfer(&target, &amount, None).unwrap();
        manager.submit(&transfer, "paper key");
        fixture.system.process_pending();
        recorder.take();

        assert!(fixture.engine.fail(transfer.handle(), TransferSubmitError::Dropped));
        fixture.system.process_pending();
        let events = recorder.take();
        assert!(events[0].starts_with("TransferHandle#4 changed(submitted -> errored("));
        assert_eq!(events[1], "WalletHandle#2 transfer_changed(TransferHandle#4)");
        assert_eq!(transfer.state().error(), Some(TransferSubmitError::Dropped));
        assert!(!fixture.engine.fail(transfer.handle(), TransferSubmitError::Dropped));
        assert_eq!(wallet.balance().value(), 50_000);

        wallet.set_default_fee_basis(TransferFeeBasis::Bitcoin { fee_per_kb: 20_000 });
        assert_eq!(
            recorder.take(),
            strings(&["WalletHandle#2 fee_basis_updated(20000 per kB)"])
        );
        assert_eq!(wallet.estimate_fee(&amount, None).value(), 4_520);
    }

    #[test]
    fn test_engine_refuses_transfers() {
        let (fixture, _recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        fixture.fund(&wallet, 5_000);
        let target = SimulatedEngine::counterparty(&fixture.bitcoin, "merchant");

        let too_much = Amount::from_base(5_000, wallet.fee_unit());
        assert!(wallet.create_transfer(&target, &too_much, None).is_none());

        let fine = Amount::from_base(100, wallet.fee_unit());
        assert!(wallet
            .create_transfer(&Address::new("not-an-address"), &fine, None)
            .is_none());

        let (wei, _) = units::eth();
        let foreign = Amount::from_base(100, &wei);
        assert!(wallet.create_transfer(&target, &foreign, None).is_none());
        assert_eq!(wallet.transfers().len(), 1);
    }

    #[test]
    fn test_replacement_supersedes_original() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.ethereum_manager();
        let wallet = manager.primary_wallet().unwrap();
        fixture.fund(&wallet, 1_000_000_000_000_000_000);

        let target = SimulatedEngine::counterparty(&fixture.ethereum, "merchant");
        let amount = Amount::create_string("0.1", wallet.unit()).unwrap();
        let original = wallet.create_transfer(&target, &amount, None).unwrap();
        manager.submit(&original, "paper key");
        fixture.system.process_pending();
        assert_eq!(original.nonce(), Some(0));

        let options = ReplaceOptions {
            update_gas_price: true,
            ..ReplaceOptions::default()
        };
        let replacement = wallet.create_transfer_to_replace(&original, options).unwrap();
        fixture.system.process_pending();
        assert_eq!(replacement.nonce(), Some(0));
        assert_eq!(replacement.fee().value(), 2 * original.fee().value());
        assert_eq!(replacement.supersedes().unwrap().original, original.handle());
        recorder.take();

        manager.submit(&replacement, "paper key");
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&[
                "TransferHandle#5 changed(created -> signed)",
                "WalletHandle#2 transfer_changed(TransferHandle#5)",
                "TransferHandle#5 changed(signed -> submitted)",
                "WalletHandle#2 transfer_changed(TransferHandle#5)",
                "TransferHandle#4 changed(submitted -> replaced)",
                "WalletHandle#2 transfer_changed(TransferHandle#4)",
                "WalletHandle#2 transfer_submitted(TransferHandle#5, true)",
                "WalletHandle#2 balance_updated(0.899916 ETH)",
            ])
        );
        assert_eq!(original.state(), TransferState::Replaced);
    }

    #[test]
    fn test_replace_errored_nonce_too_low() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.ethereum_manager();
        let wallet = manager.primary_wallet().unwrap();
        fixture.fund(&wallet, 1_000_000_000_000_000_000);

        let target = SimulatedEngine::counterparty(&fixture.ethereum, "merchant");
        let amount = Amount::create_string("0.1", wallet.unit()).unwrap();
        let original = wallet.create_transfer(&target, &amount, None).unwrap();
        fixture.engine.fail_next_submit(TransferSubmitError::NonceTooLow);
        manager.submit(&original, "paper key");
        fixture.system.process_pending();
        let error = original.state().error().unwrap();
        assert_eq!(error, TransferSubmitError::NonceTooLow);

        let options = error.suggested_replacement().unwrap();
        assert!(options.update_nonce);
        let replacement = wallet.create_transfer_to_replace(&original, options).unwrap();
        fixture.system.process_pending();
        assert_ne!(replacement.handle(), original.handle());
        assert_eq!(replacement.target(), original.target());
        assert_eq!(replacement.amount(), original.amount());
        assert_eq!(original.nonce(), Some(0));
        assert_eq!(replacement.nonce(), Some(1));
        assert_eq!(replacement.fee_basis(), original.fee_basis());
        assert_eq!(wallet.transfers().len(), 3);
        recorder.take();

        manager.submit(&replacement, "paper key");
        fixture.system.process_pending();
        assert_eq!(replacement.state(), TransferState::Submitted);
        // The failed transfer keeps its error rather than becoming replaced
        assert_eq!(original.state().error(), Some(TransferSubmitError::NonceTooLow));
        assert!(!recorder
            .take()
            .iter()
            .any(|e| e.starts_with("TransferHandle#4 changed")));

        let cancellation = wallet.create_transfer_to_cancel(&original).unwrap();
        assert_eq!(cancellation.target(), wallet.source());
        assert!(cancellation.amount().is_zero());
    }

    #[test]
    fn test_cancel_loses_to_inclusion() {
        let (fixture, _recorder) = Fixture::new();
        let manager = fixture.ethereum_manager();
        let wallet = manager.primary_wallet().unwrap();
        fixture.fund(&wallet, 1_000_000_000_000_000_000);

        let target = SimulatedEngine::counterparty(&fixture.ethereum, "merchant");
        let amount = Amount::create_string("0.25", wallet.unit()).unwrap();
        let original = wallet.create_transfer(&target, &amount, None).unwrap();
        manager.submit(&original, "paper key");
        fixture.system.process_pending();

        let cancel = wallet.create_transfer_to_cancel(&original).unwrap();
        assert_eq!(cancel.direction(), TransferDirection::Recovered);
        assert!(cancel.directed_amount().is_zero());

        assert!(fixture.engine.include(original.handle(), 1_000, 0, BLOCK_TIMESTAMP));
        fixture.system.process_pending();
        manager.submit(&cancel, "paper key");
        fixture.system.process_pending();

        assert!(original.state().confirmation().is_some());
        assert_eq!(cancel.state(), TransferState::Submitted);
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        let transfer = fixture.fund(&wallet, 50_000);
        recorder.take();

        fixture.system.apply(EngineEvent::Transfer {
            manager: manager.handle(),
            wallet: wallet.handle(),
            transfer: transfer.handle(),
            event: TransferCallback::Changed {
                new: TransferState::Pending,
            },
        });
        // Unknown handles are logged and dropped
        fixture.system.apply(EngineEvent::Transfer {
            manager: manager.handle(),
            wallet: wallet.handle(),
            transfer: crate::engine::TransferHandle(999),
            event: TransferCallback::Deleted,
        });
        fixture.system.apply(EngineEvent::Manager {
            manager: ManagerHandle(999),
            event: ManagerCallback::SyncStarted,
        });

        assert!(recorder.take().is_empty());
        assert!(transfer.state().confirmation().is_some());
    }

    #[test]
    fn test_transfer_deletion_order() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        let transfer = fixture.fund(&wallet, 50_000);
        recorder.take();

        assert!(fixture.engine.delete(transfer.handle()));
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&[
                "TransferHandle#3 changed(included(block 100, index 0) -> deleted)",
                "TransferHandle#3 deleted",
                "WalletHandle#2 transfer_deleted(TransferHandle#3)",
            ])
        );
        assert!(transfer.state().is_deleted());
        assert!(!wallet.has_transfer(&transfer));
        assert!(!wallet.remove(&transfer));
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_wallet_removal_order() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        recorder.take();

        assert!(fixture.engine.delete_wallet(wallet.handle()));
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&[
                "WalletHandle#2 changed(created -> deleted)",
                "WalletHandle#2 deleted",
                "ManagerHandle#1 wallet_deleted(WalletHandle#2)",
            ])
        );
        assert_eq!(wallet.state(), WalletState::Deleted);
        assert!(manager.wallets().is_empty());
        assert!(!manager.remove_wallet(&wallet));
    }

    #[test]
    #[should_panic(expected = "belongs to")]
    fn test_adding_transfer_to_another_wallet_panics() {
        let (fixture, _recorder) = Fixture::new();
        let bitcoin = fixture.bitcoin_manager().primary_wallet().unwrap();
        let ethereum = fixture.ethereum_manager().primary_wallet().unwrap();
        let transfer = fixture.fund(&bitcoin, 1_000);
        ethereum.add(&transfer);
    }

    #[test]
    #[should_panic(expected = "is not held")]
    fn test_submitting_unheld_transfer_panics() {
        let (fixture, _recorder) = Fixture::new();
        let bitcoin = fixture.bitcoin_manager();
        let ethereum = fixture.ethereum_manager();
        let wallet = bitcoin.primary_wallet().unwrap();
        let transfer = fixture.fund(&wallet, 1_000);
        ethereum.submit(&transfer, "paper key");
    }

    #[test]
    #[should_panic(expected = "fee estimate")]
    fn test_fee_estimate_in_wrong_currency_panics() {
        let (fixture, _recorder) = Fixture::new();
        let wallet = fixture.bitcoin_manager().primary_wallet().unwrap();
        let (wei, _) = units::eth();
        wallet.estimate_fee(&Amount::from_base(1, &wei), None);
    }

    #[test]
    fn test_connectivity_and_sync() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        recorder.take();

        fixture.system.start();
        fixture.system.process_pending();
        assert_eq!(manager.state(), WalletManagerState::Connected);
        fixture.system.start();
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&["ManagerHandle#1 changed(created -> connected)"])
        );

        manager.sync();
        fixture.system.process_pending();
        assert_eq!(
            recorder.take(),
            strings(&[
                "ManagerHandle#1 changed(connected -> syncing)",
                "ManagerHandle#1 sync_started",
                "ManagerHandle#1 sync_progress(50%)",
                "ManagerHandle#1 sync_progress(100%)",
                "ManagerHandle#1 sync_ended",
                "ManagerHandle#1 changed(syncing -> connected)",
            ])
        );

        fixture.system.stop();
        fixture.system.process_pending();
        assert_eq!(manager.state(), WalletManagerState::Disconnected);
        assert_eq!(
            recorder.take(),
            strings(&["ManagerHandle#1 changed(connected -> disconnected)"])
        );
    }

    #[test]
    fn test_subscribed_wallets_follow_membership() {
        let listener = Arc::new(RecordingListener::default());
        let subscriber = Arc::new(RecordingSubscriber::default());
        let fixture = Fixture::with_subscriber(&listener, subscriber.clone());

        fixture.bitcoin_manager();
        let ethereum = fixture.ethereum_manager();
        assert!(!fixture.system.update_subscribed_wallets());

        let snapshots = subscriber.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].id, ACCOUNT_UIDS);
        assert_eq!(
            snapshots[1].currencies.keys().cloned().collect::<Vec<_>>(),
            vec!["btc".to_string(), "eth".to_string()]
        );
        assert!(snapshots[1].to_json().unwrap().contains("\"eth\""));

        let wallet = ethereum.primary_wallet().unwrap();
        fixture.engine.delete_wallet(wallet.handle());
        fixture.system.process_pending();
        let snapshots = subscriber.snapshots();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[2].currencies.len(), 1);
    }

    #[test]
    fn test_dropped_listener_silences_events() {
        let (fixture, recorder) = Fixture::new();
        drop(recorder);
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        let transfer = fixture.fund(&wallet, 1_000);
        assert!(transfer.state().confirmation().is_some());
    }

    #[tokio::test]
    async fn test_run_applies_until_cancelled() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        recorder.take();

        let cancel = CancellationToken::new();
        let pump = tokio::spawn({
            let system = fixture.system.clone();
            let cancel = cancel.clone();
            async move { system.run(cancel).await }
        });

        fixture.engine.advance_height(manager.handle(), 150);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while manager.height() != 150 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        pump.await.unwrap();
        assert_eq!(
            recorder.take(),
            strings(&["ManagerHandle#1 block_updated(150)"])
        );

        // Nothing is applied once the loop has stopped
        fixture.engine.advance_height(manager.handle(), 151);
        assert_eq!(fixture.system.pending_events(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replacement_keeps_link_while_loop_runs() {
        let (fixture, _recorder) = Fixture::new();
        let manager = fixture.ethereum_manager();
        let wallet = manager.primary_wallet().unwrap();
        fixture.fund(&wallet, 1_000_000_000_000_000_000);
        let target = SimulatedEngine::counterparty(&fixture.ethereum, "merchant");
        let amount = Amount::create_string("0.01", wallet.unit()).unwrap();
        let options = ReplaceOptions {
            update_gas_price: true,
            ..ReplaceOptions::default()
        };

        let cancel = CancellationToken::new();
        let pump = tokio::spawn({
            let system = fixture.system.clone();
            let cancel = cancel.clone();
            async move { system.run(cancel).await }
        });

        for _ in 0..20 {
            let original = wallet.create_transfer(&target, &amount, None).unwrap();
            manager.submit(&original, "paper key");
            let replacement = wallet.create_transfer_to_replace(&original, options).unwrap();
            assert_eq!(
                replacement.supersedes().map(|s| s.original),
                Some(original.handle())
            );
            manager.submit(&replacement, "paper key");
            tokio::time::timeout(std::time::Duration::from_secs(5), async {
                while original.state() != TransferState::Replaced {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
        }

        cancel.cancel();
        pump.await.unwrap();
    }

    #[test]
    fn test_adding_held_transfer_is_silent() {
        let (fixture, recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        let transfer = fixture.fund(&wallet, 5);
        recorder.take();

        assert!(!wallet.add(&transfer));
        assert!(!wallet.add(&transfer));
        assert_eq!(wallet.transfers().len(), 1);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_zero_balance_then_receipt() {
        let (fixture, _recorder) = Fixture::new();
        let manager = fixture.bitcoin_manager();
        let wallet = manager.primary_wallet().unwrap();
        assert!(wallet.balance().is_zero());
        assert!(wallet.transfers().is_empty());

        fixture.fund(&wallet, 5);
        assert_eq!(wallet.balance().value(), 5);
        assert_eq!(wallet.balance().unit(), wallet.unit());
    }
}
