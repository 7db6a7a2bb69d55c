//! Shared fixtures for system-level tests

use std::sync::Arc;

use parking_lot::Mutex;

use super::listener::{
    Announcement, SystemListener, TransferListener, WalletListener, WalletManagerListener,
};
use super::subscription::{SubscribedWallets, WalletSubscriber};
use super::{System, SystemEvent};
use crate::engine::simulated::SimulatedEngine;
use crate::manager::{WalletManager, WalletManagerEvent, WalletManagerMode};
use crate::network::{fixtures, Account, Network};
use crate::transfer::{Transfer, TransferEvent};
use crate::wallet::{Wallet, WalletEvent};

pub(crate) const ACCOUNT_UIDS: &str = "0b2ad3c4-walletkit-test-account";
pub(crate) const BLOCK_TIMESTAMP: u64 = 1_700_000_000;

/// Records every announcement as its display string
#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Drain the recorded events
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }

    fn record(&self, announcement: Announcement) {
        self.events.lock().push(announcement.to_string());
    }
}

impl TransferListener for RecordingListener {
    fn handle_transfer_event(
        &self,
        _system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
        event: TransferEvent,
    ) {
        self.record(Announcement::transfer(manager, wallet, transfer, event));
    }
}

impl WalletListener for RecordingListener {
    fn handle_wallet_event(
        &self,
        _system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        event: WalletEvent,
    ) {
        self.record(Announcement::wallet(manager, wallet, event));
    }
}

impl WalletManagerListener for RecordingListener {
    fn handle_manager_event(
        &self,
        _system: &System,
        manager: &Arc<WalletManager>,
        event: WalletManagerEvent,
    ) {
        self.record(Announcement::manager(manager, event));
    }
}

impl SystemListener for RecordingListener {
    fn handle_system_event(&self, _system: &System, event: SystemEvent) {
        self.record(Announcement::System { event });
    }
}

/// Keeps every subscribed-wallets snapshot it is handed
#[derive(Default)]
pub(crate) struct RecordingSubscriber {
    snapshots: Mutex<Vec<SubscribedWallets>>,
}

impl RecordingSubscriber {
    pub fn snapshots(&self) -> Vec<SubscribedWallets> {
        self.snapshots.lock().clone()
    }
}

impl WalletSubscriber for RecordingSubscriber {
    fn update_subscribed_wallets(&self, wallets: &SubscribedWallets) {
        self.snapshots.lock().push(wallets.clone());
    }
}

/// A system over a simulated engine with the bitcoin and ethereum test networks registered
pub(crate) struct Fixture {
    pub engine: Arc<SimulatedEngine>,
    pub system: System,
    pub bitcoin: Arc<Network>,
    pub ethereum: Arc<Network>,
}

impl Fixture {
    /// Fixture with a recording listener; the caller keeps the listener alive
    pub fn new() -> (Self, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        (Self::with_listener(&listener), listener)
    }

    pub fn with_listener<L: SystemListener + 'static>(listener: &Arc<L>) -> Self {
        Self::build(listener, None)
    }

    pub fn with_subscriber<L: SystemListener + 'static>(
        listener: &Arc<L>,
        subscriber: Arc<dyn WalletSubscriber>,
    ) -> Self {
        Self::build(listener, Some(subscriber))
    }

    fn build<L: SystemListener + 'static>(
        listener: &Arc<L>,
        subscriber: Option<Arc<dyn WalletSubscriber>>,
    ) -> Self {
        let engine = Arc::new(SimulatedEngine::new());
        let system = System::new(
            Account::new(ACCOUNT_UIDS),
            "/tmp/walletkit-test",
            engine.clone(),
            listener,
            subscriber,
        );
        let bitcoin = Arc::new(fixtures::bitcoin());
        let ethereum = Arc::new(fixtures::ethereum());
        system.add_network(bitcoin.clone());
        system.add_network(ethereum.clone());
        Self {
            engine,
            system,
            bitcoin,
            ethereum,
        }
    }

    /// Bitcoin manager with its primary wallet already adopted
    pub fn bitcoin_manager(&self) -> Arc<WalletManager> {
        self.manager_for(&self.bitcoin)
    }

    pub fn ethereum_manager(&self) -> Arc<WalletManager> {
        self.manager_for(&self.ethereum)
    }

    fn manager_for(&self, network: &Arc<Network>) -> Arc<WalletManager> {
        let manager = self
            .system
            .create_wallet_manager(network, WalletManagerMode::ApiOnly)
            .unwrap();
        self.system.process_pending();
        manager
    }

    /// Receive `amount` base units into `wallet` and include them at the current height
    pub fn fund(&self, wallet: &Arc<Wallet>, amount: i128) -> Arc<Transfer> {
        let from = SimulatedEngine::counterparty(wallet.network(), "faucet");
        let handle = self.engine.receive(wallet.handle(), &from, amount).unwrap();
        assert!(self.engine.include(
            handle,
            wallet.network().height(),
            0,
            BLOCK_TIMESTAMP
        ));
        self.system.process_pending();
        wallet.transfer_by_handle(handle).unwrap()
    }
}
