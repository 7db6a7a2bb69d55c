//! Serial event dispatch
//!
//! Listener callbacks run on whichever thread applied the update. A `DispatchingListener`
//! moves them onto one consumer task instead: every announcement goes into a bounded queue and
//! the consumer hands them to the wrapped listener strictly in order.
//!
//! Under `Block` nothing is dropped: once the queue is full, later announcements wait in a
//! backlog that the consumer drains after the queue, so order holds and the announcing thread
//! never parks a runtime worker. Under `Newest` the incoming announcement is dropped and
//! counted instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, TrySendError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::listener::{
    Announcement, SystemListener, TransferListener, WalletListener, WalletManagerListener,
};
use super::{System, SystemEvent};
use crate::config::DropPolicy as ConfigDropPolicy;
use crate::manager::{WalletManager, WalletManagerEvent};
use crate::transfer::{Transfer, TransferEvent};
use crate::wallet::{Wallet, WalletEvent};

/// Drop policy for when queue is full
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropPolicy {
    /// Drop newest incoming items
    Newest,
    /// Keep everything, holding the excess in a backlog
    Block,
}

impl From<ConfigDropPolicy> for DropPolicy {
    fn from(policy: ConfigDropPolicy) -> Self {
        match policy {
            ConfigDropPolicy::Newest => DropPolicy::Newest,
            ConfigDropPolicy::Block => DropPolicy::Block,
        }
    }
}

struct Dispatch {
    system: System,
    announcement: Announcement,
}

impl Dispatch {
    fn deliver(self, listener: &dyn SystemListener) {
        self.announcement.deliver(&self.system, listener);
    }
}

type Backlog = Arc<Mutex<VecDeque<Dispatch>>>;

/// Deliver the backlog, but only while the queue is empty; the queue holds older announcements
fn drain_backlog(backlog: &Backlog, rx: &Receiver<Dispatch>, listener: &dyn SystemListener) {
    loop {
        let next = {
            let mut backlog = backlog.lock();
            if !rx.is_empty() {
                return;
            }
            backlog.pop_front()
        };
        match next {
            Some(dispatch) => dispatch.deliver(listener),
            None => return,
        }
    }
}

/// Forwards every event to a wrapped listener from a single consumer task
pub struct DispatchingListener {
    capacity: usize,
    drop_policy: DropPolicy,
    tx: async_channel::Sender<Dispatch>,
    backlog: Backlog,
    dropped_count: AtomicU64,
}

impl DispatchingListener {
    /// Start the consumer task on the current tokio runtime
    pub fn spawn(
        inner: Arc<dyn SystemListener>,
        capacity: usize,
        drop_policy: DropPolicy,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = async_channel::bounded::<Dispatch>(capacity.max(1));
        let backlog: Backlog = Arc::default();

        let consumer = tokio::spawn({
            let backlog = backlog.clone();
            async move {
                while let Ok(dispatch) = rx.recv().await {
                    dispatch.deliver(inner.as_ref());
                    drain_backlog(&backlog, &rx, inner.as_ref());
                }
                drain_backlog(&backlog, &rx, inner.as_ref());
                debug!("Dispatch queue closed");
            }
        });

        let listener = Arc::new(Self {
            capacity: capacity.max(1),
            drop_policy,
            tx,
            backlog,
            dropped_count: AtomicU64::new(0),
        });
        (listener, consumer)
    }

    fn enqueue(&self, system: &System, announcement: Announcement) {
        let dispatch = Dispatch {
            system: system.clone(),
            announcement,
        };
        match self.drop_policy {
            DropPolicy::Newest => match self.tx.try_send(dispatch) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Dropped {} due to backpressure",
                        dropped.announcement
                    );
                }
                Err(TrySendError::Closed(_)) => warn!("Dispatch queue is closed"),
            },
            DropPolicy::Block => {
                if self.tx.is_closed() {
                    warn!("Dispatch queue is closed");
                    return;
                }
                let mut backlog = self.backlog.lock();
                if !backlog.is_empty() {
                    backlog.push_back(dispatch);
                    return;
                }
                match self.tx.try_send(dispatch) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dispatch)) => {
                        warn!("Dispatch queue is full, holding events in the backlog");
                        backlog.push_back(dispatch);
                    }
                    Err(TrySendError::Closed(_)) => warn!("Dispatch queue is closed"),
                }
            }
        }
    }

    /// Stop accepting events; the consumer drains what is queued and exits
    pub fn close(&self) {
        self.tx.close();
    }

    /// Get current queue length, backlog included
    pub fn len(&self) -> usize {
        self.tx.len() + self.backlog.lock().len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get number of dropped events
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Get capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get utilization percentage
    pub fn utilization(&self) -> f64 {
        (self.len() as f64 / self.capacity as f64) * 100.0
    }
}

impl TransferListener for DispatchingListener {
    fn handle_transfer_event(
        &self,
        system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
        event: TransferEvent,
    ) {
        self.enqueue(
            system,
            Announcement::transfer(manager, wallet, transfer, event),
        );
    }
}

impl WalletListener for DispatchingListener {
    fn handle_wallet_event(
        &self,
        system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        event: WalletEvent,
    ) {
        self.enqueue(system, Announcement::wallet(manager, wallet, event));
    }
}

impl WalletManagerListener for DispatchingListener {
    fn handle_manager_event(
        &self,
        system: &System,
        manager: &Arc<WalletManager>,
        event: WalletManagerEvent,
    ) {
        self.enqueue(system, Announcement::manager(manager, event));
    }
}

impl SystemListener for DispatchingListener {
    fn handle_system_event(&self, system: &System, event: SystemEvent) {
        self.enqueue(system, Announcement::System { event });
    }
}
