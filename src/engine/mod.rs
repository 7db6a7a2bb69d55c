//! Wallet engine collaborator
//!
//! The engine owns keys, chain data and the network client. This crate only sees it through
//! opaque handles and the [`WalletEngine`] trait; asynchronous engine activity comes back as
//! [`EngineEvent`]s pushed into an [`EngineEventSink`].

pub mod simulated;

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::amount::Amount;
use crate::error::Result;
use crate::manager::{WalletManagerMode, WalletManagerState};
use crate::network::{Account, Address, Network};
use crate::transfer::{ReplaceOptions, TransferFeeBasis, TransferHash, TransferState};
use crate::wallet::WalletState;

macro_rules! engine_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

engine_handle!(
    /// Engine-side identity of a wallet manager
    ManagerHandle
);
engine_handle!(
    /// Engine-side identity of a wallet
    WalletHandle
);
engine_handle!(
    /// Engine-side identity of a transfer
    TransferHandle
);

/// Manager-level callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerCallback {
    Changed { new: WalletManagerState },
    Deleted,
    WalletAdded { wallet: WalletHandle },
    WalletChanged { wallet: WalletHandle },
    WalletDeleted { wallet: WalletHandle },
    SyncStarted,
    SyncProgress { percent: f64 },
    SyncEnded { error: Option<String> },
    BlockHeightUpdated { height: u64 },
}

/// Wallet-level callbacks.
///
/// Transfer state changes arrive as [`TransferCallback::Changed`]; the system derives the
/// wallet-level notification itself. `TransferChanged` here reports anything else about a
/// transfer that changed.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletCallback {
    Changed { new: WalletState },
    Deleted,
    TransferAdded { transfer: TransferHandle },
    TransferChanged { transfer: TransferHandle },
    TransferSubmitted { transfer: TransferHandle, success: bool },
    TransferDeleted { transfer: TransferHandle },
    BalanceUpdated { balance: i128 },
    FeeBasisUpdated { fee_basis: TransferFeeBasis },
}

/// Transfer-level callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum TransferCallback {
    Changed { new: TransferState },
    Deleted,
}

/// Something the engine did on its own schedule
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Manager {
        manager: ManagerHandle,
        event: ManagerCallback,
    },
    Wallet {
        manager: ManagerHandle,
        wallet: WalletHandle,
        event: WalletCallback,
    },
    Transfer {
        manager: ManagerHandle,
        wallet: WalletHandle,
        transfer: TransferHandle,
        event: TransferCallback,
    },
}

/// Where an engine reports callbacks. Never blocks and never drops while the system lives.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    tx: async_channel::Sender<EngineEvent>,
}

impl EngineEventSink {
    pub(crate) fn new(tx: async_channel::Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    pub fn announce(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Engine event discarded, system is gone: {:?}", e.into_inner());
        }
    }
}

/// The chain-specific machinery behind every manager, wallet and transfer.
///
/// Accessors take handles the engine issued; unknown handles yield `None`, zero or `false`.
/// Operations that touch the network (`connect`, `sync`, `submit`) return immediately and
/// report progress through the sink passed to `create_manager`.
pub trait WalletEngine: Send + Sync {
    fn create_manager(
        &self,
        sink: EngineEventSink,
        account: &Account,
        network: &Arc<Network>,
        mode: WalletManagerMode,
        path: &str,
    ) -> Result<ManagerHandle>;

    /// The wallet for the network's own currency
    fn primary_wallet(&self, manager: ManagerHandle) -> Option<WalletHandle>;

    fn connect(&self, manager: ManagerHandle);

    fn disconnect(&self, manager: ManagerHandle);

    fn sync(&self, manager: ManagerHandle);

    /// Sign with the key derived from `paper_key` and broadcast
    fn submit(
        &self,
        manager: ManagerHandle,
        wallet: WalletHandle,
        transfer: TransferHandle,
        paper_key: &str,
    );

    /// `uids` of the wallet's currency
    fn wallet_currency(&self, wallet: WalletHandle) -> Option<String>;

    /// Address to receive into
    fn wallet_address(&self, wallet: WalletHandle) -> Option<Address>;

    fn wallet_owns_address(&self, wallet: WalletHandle, address: &Address) -> bool;

    /// Balance in base units, recomputed on every call
    fn wallet_balance(&self, wallet: WalletHandle) -> i128;

    fn wallet_default_fee_basis(&self, wallet: WalletHandle) -> Option<TransferFeeBasis>;

    fn set_wallet_default_fee_basis(&self, wallet: WalletHandle, fee_basis: &TransferFeeBasis);

    /// Fee in base units of the network currency; `None` uses the wallet's default basis
    fn estimate_fee(
        &self,
        wallet: WalletHandle,
        amount: &Amount,
        fee_basis: Option<&TransferFeeBasis>,
    ) -> i128;

    /// Build an unsigned transfer; `None` when the target is invalid or funds are short
    fn create_transfer(
        &self,
        wallet: WalletHandle,
        target: &Address,
        amount: &Amount,
        fee_basis: Option<&TransferFeeBasis>,
    ) -> Option<TransferHandle>;

    fn create_transfer_to_replace(
        &self,
        wallet: WalletHandle,
        original: TransferHandle,
        options: ReplaceOptions,
    ) -> Option<TransferHandle>;

    fn create_transfer_to_cancel(
        &self,
        wallet: WalletHandle,
        original: TransferHandle,
    ) -> Option<TransferHandle>;

    fn transfer_source(&self, transfer: TransferHandle) -> Option<Address>;

    fn transfer_target(&self, transfer: TransferHandle) -> Option<Address>;

    /// Magnitude in base units of the wallet currency
    fn transfer_amount(&self, transfer: TransferHandle) -> i128;

    /// Fee in base units of the network currency
    fn transfer_fee(&self, transfer: TransferHandle) -> i128;

    fn transfer_fee_basis(&self, transfer: TransferHandle) -> Option<TransferFeeBasis>;

    fn transfer_hash(&self, transfer: TransferHandle) -> Option<TransferHash>;

    fn transfer_nonce(&self, transfer: TransferHandle) -> Option<u64>;

    fn transfer_state(&self, transfer: TransferHandle) -> Option<TransferState>;
}
