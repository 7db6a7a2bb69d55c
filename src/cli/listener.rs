//! Listener and subscriber that report through tracing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::manager::{WalletManager, WalletManagerEvent};
use crate::system::{
    SubscribedWallets, System, SystemEvent, SystemListener, TransferListener, WalletListener,
    WalletManagerListener, WalletSubscriber,
};
use crate::transfer::{Transfer, TransferEvent, TransferState};
use crate::wallet::{Wallet, WalletEvent};

/// Logs every event and counts them
#[derive(Default)]
pub struct LoggingListener {
    events: AtomicU64,
}

impl LoggingListener {
    /// Number of events seen so far
    pub fn count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    fn seen(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }
}

impl TransferListener for LoggingListener {
    fn handle_transfer_event(
        &self,
        _system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
        event: TransferEvent,
    ) {
        self.seen();
        info!(
            "[{}] {} {}: {}",
            manager.network().name(),
            wallet.name(),
            transfer.handle(),
            event
        );
        if let TransferEvent::Changed {
            new: TransferState::Errored { error },
            ..
        } = &event
        {
            match error.suggested_replacement() {
                Some(options) => warn!(
                    "{} failed ({}); a replacement with {:?} may succeed",
                    transfer.handle(),
                    error,
                    options
                ),
                None => warn!("{} failed: {}", transfer.handle(), error),
            }
        }
    }
}

impl WalletListener for LoggingListener {
    fn handle_wallet_event(
        &self,
        _system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        event: WalletEvent,
    ) {
        self.seen();
        match &event {
            WalletEvent::BalanceUpdated { amount } => info!(
                "[{}] {} balance {}",
                manager.network().name(),
                wallet.name(),
                amount
            ),
            _ => info!(
                "[{}] {} {}",
                manager.network().name(),
                wallet.handle(),
                event
            ),
        }
    }
}

impl WalletManagerListener for LoggingListener {
    fn handle_manager_event(
        &self,
        _system: &System,
        manager: &Arc<WalletManager>,
        event: WalletManagerEvent,
    ) {
        self.seen();
        match &event {
            WalletManagerEvent::SyncProgress { .. } | WalletManagerEvent::BlockUpdated { .. } => {
                debug!("[{}] {}", manager.network().name(), event)
            }
            _ => info!("[{}] {}", manager.network().name(), event),
        }
    }
}

impl SystemListener for LoggingListener {
    fn handle_system_event(&self, system: &System, event: SystemEvent) {
        self.seen();
        info!("[system {}] {}", system.account().uids(), event);
    }
}

/// Logs the subscribed-wallets snapshot as JSON
pub struct LoggingSubscriber;

impl WalletSubscriber for LoggingSubscriber {
    fn update_subscribed_wallets(&self, wallets: &SubscribedWallets) {
        match wallets.to_json() {
            Ok(json) => info!("Subscribed wallets: {}", json),
            Err(e) => warn!("Cannot encode subscribed wallets: {}", e),
        }
    }
}
