//! Listener traits and the announcements delivered to them

use std::fmt;
use std::sync::Arc;

use super::{System, SystemEvent};
use crate::manager::{WalletManager, WalletManagerEvent};
use crate::transfer::{Transfer, TransferEvent};
use crate::wallet::{Wallet, WalletEvent};

pub trait TransferListener: Send + Sync {
    fn handle_transfer_event(
        &self,
        system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
        event: TransferEvent,
    );
}

pub trait WalletListener: Send + Sync {
    fn handle_wallet_event(
        &self,
        system: &System,
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        event: WalletEvent,
    );
}

pub trait WalletManagerListener: Send + Sync {
    fn handle_manager_event(
        &self,
        system: &System,
        manager: &Arc<WalletManager>,
        event: WalletManagerEvent,
    );
}

/// Receives every event the system and its entities raise
pub trait SystemListener: WalletManagerListener + WalletListener + TransferListener {
    fn handle_system_event(&self, system: &System, event: SystemEvent);
}

/// One event together with the entities it concerns
#[derive(Clone)]
pub enum Announcement {
    System {
        event: SystemEvent,
    },
    Manager {
        manager: Arc<WalletManager>,
        event: WalletManagerEvent,
    },
    Wallet {
        manager: Arc<WalletManager>,
        wallet: Arc<Wallet>,
        event: WalletEvent,
    },
    Transfer {
        manager: Arc<WalletManager>,
        wallet: Arc<Wallet>,
        transfer: Arc<Transfer>,
        event: TransferEvent,
    },
}

impl Announcement {
    pub(crate) fn manager(manager: &Arc<WalletManager>, event: WalletManagerEvent) -> Self {
        Self::Manager {
            manager: manager.clone(),
            event,
        }
    }

    pub(crate) fn wallet(
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        event: WalletEvent,
    ) -> Self {
        Self::Wallet {
            manager: manager.clone(),
            wallet: wallet.clone(),
            event,
        }
    }

    pub(crate) fn transfer(
        manager: &Arc<WalletManager>,
        wallet: &Arc<Wallet>,
        transfer: &Arc<Transfer>,
        event: TransferEvent,
    ) -> Self {
        Self::Transfer {
            manager: manager.clone(),
            wallet: wallet.clone(),
            transfer: transfer.clone(),
            event,
        }
    }

    /// Hand the event to the matching listener method
    pub fn deliver(self, system: &System, listener: &dyn SystemListener) {
        match self {
            Self::System { event } => listener.handle_system_event(system, event),
            Self::Manager { manager, event } => {
                listener.handle_manager_event(system, &manager, event)
            }
            Self::Wallet {
                manager,
                wallet,
                event,
            } => listener.handle_wallet_event(system, &manager, &wallet, event),
            Self::Transfer {
                manager,
                wallet,
                transfer,
                event,
            } => listener.handle_transfer_event(system, &manager, &wallet, &transfer, event),
        }
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System { event } => write!(f, "system {}", event),
            Self::Manager { manager, event } => write!(f, "{} {}", manager.handle(), event),
            Self::Wallet { wallet, event, .. } => write!(f, "{} {}", wallet.handle(), event),
            Self::Transfer {
                transfer, event, ..
            } => write!(f, "{} {}", transfer.handle(), event),
        }
    }
}
