//! Transfers: a value movement between two addresses, owned by exactly one wallet

mod state;
mod types;

pub use state::{TransferConfirmation, TransferState, TransferSubmitError};
pub use types::{
    ReplaceOptions, ReplacementKind, TransferDirection, TransferEvent, TransferFeeBasis,
    TransferHash,
};

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::amount::{Amount, Unit};
use crate::engine::{TransferHandle, WalletEngine, WalletHandle};
use crate::error::{Error, Result};
use crate::network::{Address, Network};
use crate::wallet::Wallet;

/// Link from a replacement or cancellation to the transfer it supersedes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supersedes {
    pub original: TransferHandle,
    pub kind: ReplacementKind,
}

pub struct Transfer {
    handle: TransferHandle,
    wallet_handle: WalletHandle,
    wallet: Weak<Wallet>,
    engine: Arc<dyn WalletEngine>,
    network: Arc<Network>,
    unit: Unit,
    fee_unit: Unit,
    supersedes: Option<Supersedes>,

    // Fixed once the engine has built the transaction
    source: OnceLock<Option<Address>>,
    target: OnceLock<Option<Address>>,
    amount: OnceLock<Amount>,
    direction: OnceLock<TransferDirection>,

    // Cleared on every state transition
    fee: Mutex<Option<Amount>>,

    state: RwLock<TransferState>,
}

impl Transfer {
    /// Wrap an engine transfer. Always starts in `created`.
    pub(crate) fn new(
        handle: TransferHandle,
        wallet: &Arc<Wallet>,
        supersedes: Option<Supersedes>,
    ) -> Self {
        Self {
            handle,
            wallet_handle: wallet.handle(),
            wallet: Arc::downgrade(wallet),
            engine: wallet.engine().clone(),
            network: wallet.network().clone(),
            unit: wallet.unit().clone(),
            fee_unit: wallet.fee_unit().clone(),
            supersedes,
            source: OnceLock::new(),
            target: OnceLock::new(),
            amount: OnceLock::new(),
            direction: OnceLock::new(),
            fee: Mutex::new(None),
            state: RwLock::new(TransferState::Created),
        }
    }

    pub fn handle(&self) -> TransferHandle {
        self.handle
    }

    pub fn wallet_handle(&self) -> WalletHandle {
        self.wallet_handle
    }

    /// Owning wallet, if it is still alive
    pub fn wallet(&self) -> Option<Arc<Wallet>> {
        self.wallet.upgrade()
    }

    /// Unit of the wallet's currency
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Unit fees are charged in
    pub fn fee_unit(&self) -> &Unit {
        &self.fee_unit
    }

    pub fn supersedes(&self) -> Option<Supersedes> {
        self.supersedes
    }

    pub fn source(&self) -> Option<Address> {
        self.source
            .get_or_init(|| self.engine.transfer_source(self.handle))
            .clone()
    }

    pub fn target(&self) -> Option<Address> {
        self.target
            .get_or_init(|| self.engine.transfer_target(self.handle))
            .clone()
    }

    /// Unsigned quantity moved
    pub fn amount(&self) -> Amount {
        self.amount
            .get_or_init(|| Amount::from_base(self.engine.transfer_amount(self.handle), &self.unit))
            .clone()
    }

    /// Amount expressed in another unit of the same currency
    pub fn amount_in(&self, unit: &Unit) -> Option<Amount> {
        self.amount().convert(unit).ok()
    }

    /// Signed amount as seen by the wallet: received positive, sent negative, recovered zero
    pub fn directed_amount(&self) -> Amount {
        let amount = self.amount();
        match self.direction() {
            TransferDirection::Received => amount,
            TransferDirection::Sent => amount.negate(),
            TransferDirection::Recovered => Amount::from_base(0, &self.unit),
        }
    }

    /// Direction relative to the owning wallet.
    ///
    /// # Panics
    /// When the wallet owns neither end; such a transfer was attached to the wrong wallet.
    pub fn direction(&self) -> TransferDirection {
        *self.direction.get_or_init(|| {
            let owns = |address: Option<Address>| {
                address
                    .map(|a| self.engine.wallet_owns_address(self.wallet_handle, &a))
                    .unwrap_or(false)
            };
            let source_owned = owns(self.source());
            let target_owned = owns(self.target());
            TransferDirection::from_ownership(source_owned, target_owned).unwrap_or_else(|| {
                panic!(
                    "{} is held by {} but the wallet owns neither its source nor its target",
                    self.handle, self.wallet_handle
                )
            })
        })
    }

    /// Fee paid: the confirmed fee once included, the engine's estimate before that
    pub fn fee(&self) -> Amount {
        let mut cached = self.fee.lock();
        if let Some(fee) = cached.as_ref() {
            return fee.clone();
        }
        let fee = self
            .state()
            .confirmation()
            .and_then(|c| c.fee.clone())
            .unwrap_or_else(|| {
                Amount::from_base(self.engine.transfer_fee(self.handle), &self.fee_unit)
            });
        *cached = Some(fee.clone());
        fee
    }

    pub fn fee_basis(&self) -> Option<TransferFeeBasis> {
        self.engine.transfer_fee_basis(self.handle)
    }

    /// Absent until the transfer is signed
    pub fn transaction_hash(&self) -> Option<TransferHash> {
        self.engine.transfer_hash(self.handle)
    }

    pub fn nonce(&self) -> Option<u64> {
        self.engine.transfer_nonce(self.handle)
    }

    pub fn state(&self) -> TransferState {
        self.state.read().clone()
    }

    /// Confirmation count the transfer would have at `height`
    pub fn confirmations_at(&self, height: u64) -> Option<u64> {
        match &*self.state.read() {
            TransferState::Included { confirmation } if height >= confirmation.block_number => {
                Some(1 + height - confirmation.block_number)
            }
            _ => None,
        }
    }

    /// Confirmation count at the network's current height
    pub fn confirmations(&self) -> Option<u64> {
        self.confirmations_at(self.network.height())
    }

    /// Write a new state, returning the change event, or `None` if nothing changed
    pub(crate) fn set_state(&self, new: TransferState) -> Result<Option<TransferEvent>> {
        let mut state = self.state.write();
        if *state == new {
            return Ok(None);
        }
        if !state.can_transition_to(&new) {
            return Err(Error::InvalidTransition {
                from: state.to_string(),
                to: new.to_string(),
            });
        }
        let old = std::mem::replace(&mut *state, new.clone());
        drop(state);
        *self.fee.lock() = None;
        debug!("{} state {} -> {}", self.handle, old, new);
        Ok(Some(TransferEvent::Changed { old, new }))
    }

    /// Listing order: included transfers first by (timestamp, block, index), then the rest by
    /// handle
    pub fn ordering(&self, other: &Transfer) -> Ordering {
        let ours = self.state();
        let theirs = other.state();
        match (ours.confirmation(), theirs.confirmation()) {
            (Some(a), Some(b)) => a
                .timestamp
                .cmp(&b.timestamp)
                .then(a.block_number.cmp(&b.block_number))
                .then(a.transaction_index.cmp(&b.transaction_index))
                .then(self.handle.cmp(&other.handle)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.handle.cmp(&other.handle),
        }
    }
}

impl PartialEq for Transfer {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Transfer {}

impl Hash for Transfer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("handle", &self.handle)
            .field("wallet", &self.wallet_handle)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.handle, self.state.read())
    }
}
