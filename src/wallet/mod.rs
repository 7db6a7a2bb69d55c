//! Wallets: the transfers and balance of one currency within a wallet manager

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::amount::{Amount, Currency, Unit};
use crate::engine::{ManagerHandle, TransferHandle, WalletEngine, WalletHandle};
use crate::manager::WalletManager;
use crate::network::{Address, Network};
use crate::system::{Announcement, System};
use crate::transfer::{
    ReplaceOptions, ReplacementKind, Supersedes, Transfer, TransferEvent, TransferFeeBasis,
    TransferHash, TransferState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletState {
    Created,
    Deleted,
}

impl fmt::Display for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
        })
    }
}

#[derive(Debug, Clone)]
pub enum WalletEvent {
    Created,
    Changed { old: WalletState, new: WalletState },
    Deleted,
    TransferAdded { transfer: Arc<Transfer> },
    TransferChanged { transfer: Arc<Transfer> },
    TransferSubmitted { transfer: Arc<Transfer>, success: bool },
    TransferDeleted { transfer: Arc<Transfer> },
    BalanceUpdated { amount: Amount },
    FeeBasisUpdated { fee_basis: TransferFeeBasis },
}

impl fmt::Display for WalletEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Changed { old, new } => write!(f, "changed({} -> {})", old, new),
            Self::Deleted => f.write_str("deleted"),
            Self::TransferAdded { transfer } => write!(f, "transfer_added({})", transfer.handle()),
            Self::TransferChanged { transfer } => {
                write!(f, "transfer_changed({})", transfer.handle())
            }
            Self::TransferSubmitted { transfer, success } => {
                write!(f, "transfer_submitted({}, {})", transfer.handle(), success)
            }
            Self::TransferDeleted { transfer } => {
                write!(f, "transfer_deleted({})", transfer.handle())
            }
            Self::BalanceUpdated { amount } => write!(f, "balance_updated({})", amount),
            Self::FeeBasisUpdated { fee_basis } => write!(f, "fee_basis_updated({})", fee_basis),
        }
    }
}

pub struct Wallet {
    handle: WalletHandle,
    manager_handle: ManagerHandle,
    manager: Weak<WalletManager>,
    engine: Arc<dyn WalletEngine>,
    network: Arc<Network>,
    unit: Unit,
    fee_unit: Unit,
    state: RwLock<WalletState>,
    transfers: RwLock<HashMap<TransferHandle, Arc<Transfer>>>,
}

impl Wallet {
    pub(crate) fn new(handle: WalletHandle, manager: &Arc<WalletManager>, unit: Unit) -> Self {
        Self {
            handle,
            manager_handle: manager.handle(),
            manager: Arc::downgrade(manager),
            engine: manager.engine().clone(),
            network: manager.network().clone(),
            unit,
            fee_unit: manager.fee_unit().clone(),
            state: RwLock::new(WalletState::Created),
            transfers: RwLock::new(HashMap::new()),
        }
    }

    pub fn handle(&self) -> WalletHandle {
        self.handle
    }

    pub fn manager_handle(&self) -> ManagerHandle {
        self.manager_handle
    }

    /// Owning manager, if it is still alive
    pub fn manager(&self) -> Option<Arc<WalletManager>> {
        self.manager.upgrade()
    }

    pub fn system(&self) -> Option<System> {
        self.manager()?.system()
    }

    pub(crate) fn engine(&self) -> &Arc<dyn WalletEngine> {
        &self.engine
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Default unit of the wallet's currency
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Base unit of the network currency, in which fees are charged
    pub fn fee_unit(&self) -> &Unit {
        &self.fee_unit
    }

    pub fn currency(&self) -> &Currency {
        self.unit.currency()
    }

    pub fn name(&self) -> &str {
        self.currency().code()
    }

    pub fn state(&self) -> WalletState {
        *self.state.read()
    }

    /// Current balance, asked of the engine on every call
    pub fn balance(&self) -> Amount {
        Amount::from_base(self.engine.wallet_balance(self.handle), &self.unit)
    }

    /// Address to receive into
    pub fn target(&self) -> Option<Address> {
        self.engine.wallet_address(self.handle)
    }

    /// Address transfers are sent from
    pub fn source(&self) -> Option<Address> {
        self.engine.wallet_address(self.handle)
    }

    pub fn owns_address(&self, address: &Address) -> bool {
        self.engine.wallet_owns_address(self.handle, address)
    }

    /// Snapshot of the held transfers in listing order
    pub fn transfers(&self) -> Vec<Arc<Transfer>> {
        let mut transfers: Vec<_> = self.transfers.read().values().cloned().collect();
        transfers.sort_by(|a, b| a.ordering(b));
        transfers
    }

    pub fn transfer_by_handle(&self, handle: TransferHandle) -> Option<Arc<Transfer>> {
        self.transfers.read().get(&handle).cloned()
    }

    pub fn transfer_by_hash(&self, hash: &TransferHash) -> Option<Arc<Transfer>> {
        self.transfers
            .read()
            .values()
            .find(|t| t.transaction_hash().as_ref() == Some(hash))
            .cloned()
    }

    pub fn has_transfer(&self, transfer: &Transfer) -> bool {
        self.transfers.read().contains_key(&transfer.handle())
    }

    pub fn default_fee_basis(&self) -> Option<TransferFeeBasis> {
        self.engine.wallet_default_fee_basis(self.handle)
    }

    /// Replace the default fee basis and announce `fee_basis_updated`
    pub fn set_default_fee_basis(self: &Arc<Self>, fee_basis: TransferFeeBasis) {
        self.engine
            .set_wallet_default_fee_basis(self.handle, &fee_basis);
        self.announce(WalletEvent::FeeBasisUpdated { fee_basis });
    }

    /// Estimated fee, in the network's base unit, for sending `amount`.
    ///
    /// # Panics
    /// When `amount` is not in the wallet's currency.
    pub fn estimate_fee(&self, amount: &Amount, fee_basis: Option<&TransferFeeBasis>) -> Amount {
        assert!(
            amount.has_currency(self.currency()),
            "fee estimate for {} in {} asked of the {} wallet",
            amount,
            amount.currency(),
            self.currency()
        );
        Amount::from_base(
            self.engine.estimate_fee(self.handle, amount, fee_basis),
            &self.fee_unit,
        )
    }

    /// Build a transfer of `amount` to `target` and add it to this wallet.
    ///
    /// Returns `None` when the engine refuses: invalid target, insufficient funds, or an
    /// amount in another currency.
    pub fn create_transfer(
        self: &Arc<Self>,
        target: &Address,
        amount: &Amount,
        fee_basis: Option<&TransferFeeBasis>,
    ) -> Option<Arc<Transfer>> {
        if !amount.has_currency(self.currency()) {
            warn!(
                "{} cannot send {}: wrong currency {}",
                self.handle,
                amount,
                amount.currency()
            );
            return None;
        }
        self.build(None, |engine| {
            engine.create_transfer(self.handle, target, amount, fee_basis)
        })
    }

    /// Build a transfer that supersedes `original` with the given fee adjustments.
    ///
    /// A failed transfer may be replaced too; it keeps its errored state.
    ///
    /// # Panics
    /// When `original` is not held by this wallet.
    pub fn create_transfer_to_replace(
        self: &Arc<Self>,
        original: &Transfer,
        options: ReplaceOptions,
    ) -> Option<Arc<Transfer>> {
        self.assert_holds(original);
        let supersedes = Supersedes {
            original: original.handle(),
            kind: ReplacementKind::Replace,
        };
        self.build(Some(supersedes), |engine| {
            engine.create_transfer_to_replace(self.handle, original.handle(), options)
        })
    }

    /// Build a zero-value transfer to ourselves that displaces `original`.
    ///
    /// # Panics
    /// When `original` is not held by this wallet.
    pub fn create_transfer_to_cancel(
        self: &Arc<Self>,
        original: &Transfer,
    ) -> Option<Arc<Transfer>> {
        self.assert_holds(original);
        let supersedes = Supersedes {
            original: original.handle(),
            kind: ReplacementKind::Cancel,
        };
        self.build(Some(supersedes), |engine| {
            engine.create_transfer_to_cancel(self.handle, original.handle())
        })
    }

    /// Ask the engine for a transfer and wrap it under the exclusion lock, so the queued
    /// `transfer_added` always finds the wrapper with its `supersedes` link.
    fn build(
        self: &Arc<Self>,
        supersedes: Option<Supersedes>,
        create: impl FnOnce(&dyn WalletEngine) -> Option<TransferHandle>,
    ) -> Option<Arc<Transfer>> {
        let system = self.system();
        let _exclusive = system.as_ref().map(|s| s.exclusive());
        let handle = create(self.engine.as_ref())?;
        if let Some(existing) = self.transfer_by_handle(handle) {
            return Some(existing);
        }
        let transfer = Arc::new(Transfer::new(handle, self, supersedes));
        self.add(&transfer);
        Some(transfer)
    }

    /// Add `transfer`, announcing `transfer_added` then the transfer's `created`.
    ///
    /// Adding a transfer already held does nothing and returns `false`.
    ///
    /// # Panics
    /// When `transfer` was built for another wallet.
    pub fn add(self: &Arc<Self>, transfer: &Arc<Transfer>) -> bool {
        assert_eq!(
            transfer.wallet_handle(),
            self.handle,
            "{} belongs to {}, not {}",
            transfer.handle(),
            transfer.wallet_handle(),
            self.handle
        );
        let Some((system, manager)) = self.context() else {
            warn!("{} is detached; not adding {}", self.handle, transfer.handle());
            return false;
        };
        let _exclusive = system.exclusive();

        {
            let mut transfers = self.transfers.write();
            if transfers.contains_key(&transfer.handle()) {
                return false;
            }
            transfers.insert(transfer.handle(), transfer.clone());
        }
        debug!("{} added {}", self.handle, transfer.handle());

        system.announce(vec![
            Announcement::wallet(
                &manager,
                self,
                WalletEvent::TransferAdded {
                    transfer: transfer.clone(),
                },
            ),
            Announcement::transfer(&manager, self, transfer, TransferEvent::Created),
        ]);
        true
    }

    /// Remove `transfer`, moving it to `deleted` and announcing the transfer's `deleted`
    /// then `transfer_deleted`.
    ///
    /// Removing a transfer not held does nothing and returns `false`.
    pub fn remove(self: &Arc<Self>, transfer: &Arc<Transfer>) -> bool {
        let Some((system, manager)) = self.context() else {
            warn!("{} is detached; not removing {}", self.handle, transfer.handle());
            return false;
        };
        let _exclusive = system.exclusive();

        let Some(transfer) = self.transfers.write().remove(&transfer.handle()) else {
            return false;
        };
        debug!("{} removed {}", self.handle, transfer.handle());

        let mut announcements = Vec::with_capacity(3);
        match transfer.set_state(TransferState::Deleted) {
            Ok(Some(changed)) => {
                announcements.push(Announcement::transfer(&manager, self, &transfer, changed))
            }
            Ok(None) => {}
            Err(e) => warn!("{} removed without state change: {}", transfer.handle(), e),
        }
        announcements.push(Announcement::transfer(
            &manager,
            self,
            &transfer,
            TransferEvent::Deleted,
        ));
        announcements.push(Announcement::wallet(
            &manager,
            self,
            WalletEvent::TransferDeleted { transfer },
        ));
        system.announce(announcements);
        true
    }

    /// Write a new state and announce `changed`; `deleted` follows a move into deleted
    pub(crate) fn set_state(self: &Arc<Self>, new: WalletState) -> Vec<Announcement> {
        let old = {
            let mut state = self.state.write();
            if *state == new || *state == WalletState::Deleted {
                return Vec::new();
            }
            std::mem::replace(&mut *state, new)
        };
        info!("{} state {} -> {}", self.handle, old, new);

        let Some(manager) = self.manager() else {
            return Vec::new();
        };
        let mut announcements = vec![Announcement::wallet(
            &manager,
            self,
            WalletEvent::Changed { old, new },
        )];
        if new == WalletState::Deleted {
            announcements.push(Announcement::wallet(&manager, self, WalletEvent::Deleted));
        }
        announcements
    }

    /// Announce an event that carries no local state change
    pub(crate) fn announce(self: &Arc<Self>, event: WalletEvent) {
        if let Some((system, manager)) = self.context() {
            let _exclusive = system.exclusive();
            system.announce(vec![Announcement::wallet(&manager, self, event)]);
        }
    }

    fn context(&self) -> Option<(System, Arc<WalletManager>)> {
        let manager = self.manager()?;
        let system = manager.system()?;
        Some((system, manager))
    }

    fn assert_holds(&self, transfer: &Transfer) {
        assert!(
            transfer.wallet_handle() == self.handle && self.has_transfer(transfer),
            "{} is not held by {}",
            transfer.handle(),
            self.handle
        );
    }
}

impl PartialEq for Wallet {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Wallet {}

impl Hash for Wallet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("handle", &self.handle)
            .field("manager", &self.manager_handle)
            .field("currency", &self.currency().code())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl fmt::Display for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.handle, self.name())
    }
}
