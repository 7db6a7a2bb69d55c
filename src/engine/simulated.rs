//! In-memory wallet engine
//!
//! Keeps one wallet per manager, derives deterministic addresses, signs by hashing, and
//! reports every change through the manager's sink the way a chain-backed engine would. The
//! driver methods (`receive`, `include`, `fail`, ...) play the part of the network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{
    EngineEvent, EngineEventSink, ManagerCallback, ManagerHandle, TransferCallback,
    TransferHandle, WalletCallback, WalletEngine, WalletHandle,
};
use crate::amount::{Amount, Currency, Unit};
use crate::error::{Error, Result};
use crate::manager::{WalletManagerMode, WalletManagerState};
use crate::network::{Account, Address, Network};
use crate::transfer::{
    ReplaceOptions, ReplacementKind, TransferConfirmation, TransferFeeBasis, TransferHash,
    TransferState, TransferSubmitError,
};

lazy_static::lazy_static! {
    static ref ETHEREUM_ADDRESS: Regex =
        Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("Invalid ethereum address pattern");
    static ref BITCOIN_ADDRESS: Regex =
        Regex::new(r"^(bc1|[13])[a-km-zA-HJ-NP-Z0-9]{25,62}$")
            .expect("Invalid bitcoin address pattern");
}

/// Typical one-input two-output transaction
const BITCOIN_TX_SIZE: u64 = 226;
const DEFAULT_FEE_PER_KB: u64 = 10_000;
const DEFAULT_GAS_PRICE: i128 = 2_000_000_000;
const DEFAULT_GAS_LIMIT: u64 = 21_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chain {
    Bitcoin,
    Ethereum,
}

impl Chain {
    fn of(network: &Network) -> Self {
        match network.currency().code() {
            "eth" => Chain::Ethereum,
            _ => Chain::Bitcoin,
        }
    }

    fn derive_address(self, network_uids: &str, seed: &str) -> Address {
        let digest = Sha256::digest(format!("{}:{}", network_uids, seed).as_bytes());
        match self {
            Chain::Ethereum => Address::new(format!("0x{}", hex::encode(&digest[..20]))),
            Chain::Bitcoin => Address::new(format!("bc1q{}", hex::encode(&digest[..19]))),
        }
    }

    fn is_valid(self, address: &Address) -> bool {
        match self {
            Chain::Ethereum => ETHEREUM_ADDRESS.is_match(address.as_str()),
            Chain::Bitcoin => BITCOIN_ADDRESS.is_match(address.as_str()),
        }
    }

    fn default_fee_basis(self, base_unit: &Unit) -> TransferFeeBasis {
        match self {
            Chain::Bitcoin => TransferFeeBasis::Bitcoin {
                fee_per_kb: DEFAULT_FEE_PER_KB,
            },
            Chain::Ethereum => TransferFeeBasis::Ethereum {
                gas_price: Amount::from_base(DEFAULT_GAS_PRICE, base_unit),
                gas_limit: DEFAULT_GAS_LIMIT,
            },
        }
    }
}

fn fee_of(fee_basis: &TransferFeeBasis) -> i128 {
    fee_basis.fee_for_size(BITCOIN_TX_SIZE).unwrap_or(0)
}

/// Broadcast transfers, and failed ones awaiting a resubmission, can be superseded
fn replaceable(state: &TransferState) -> bool {
    matches!(
        state,
        TransferState::Submitted | TransferState::Pending | TransferState::Errored { .. }
    )
}

fn bumped(fee_basis: &TransferFeeBasis, options: ReplaceOptions) -> TransferFeeBasis {
    match fee_basis {
        TransferFeeBasis::Bitcoin { fee_per_kb } => TransferFeeBasis::Bitcoin {
            fee_per_kb: if options.update_gas_price {
                fee_per_kb.saturating_mul(2)
            } else {
                *fee_per_kb
            },
        },
        TransferFeeBasis::Ethereum {
            gas_price,
            gas_limit,
        } => TransferFeeBasis::Ethereum {
            gas_price: if options.update_gas_price {
                Amount::from_base(gas_price.value().saturating_mul(2), gas_price.unit())
            } else {
                gas_price.clone()
            },
            gas_limit: if options.update_gas_limit {
                gas_limit.saturating_mul(2)
            } else {
                *gas_limit
            },
        },
    }
}

struct SimManager {
    sink: EngineEventSink,
    network: Arc<Network>,
    chain: Chain,
    fee_unit: Unit,
    primary: WalletHandle,
    connected: bool,
}

struct SimWallet {
    manager: ManagerHandle,
    currency: Currency,
    address: Address,
    fee_basis: TransferFeeBasis,
    next_nonce: u64,
}

struct SimTransfer {
    wallet: WalletHandle,
    source: Option<Address>,
    target: Option<Address>,
    amount: i128,
    fee: i128,
    fee_basis: TransferFeeBasis,
    nonce: Option<u64>,
    hash: Option<TransferHash>,
    supersedes: Option<(TransferHandle, ReplacementKind)>,
    state: TransferState,
}

#[derive(Default)]
struct Inner {
    managers: HashMap<ManagerHandle, SimManager>,
    wallets: HashMap<WalletHandle, SimWallet>,
    transfers: HashMap<TransferHandle, SimTransfer>,
    submit_failures: VecDeque<TransferSubmitError>,
}

impl Inner {
    fn sink(&self, manager: ManagerHandle) -> Option<&EngineEventSink> {
        self.managers.get(&manager).map(|m| &m.sink)
    }

    fn wallet_sink(&self, wallet: WalletHandle) -> Option<(ManagerHandle, &EngineEventSink)> {
        let manager = self.wallets.get(&wallet)?.manager;
        Some((manager, self.sink(manager)?))
    }

    fn chain_of(&self, wallet: WalletHandle) -> Option<Chain> {
        let manager = self.wallets.get(&wallet)?.manager;
        self.managers.get(&manager).map(|m| m.chain)
    }

    fn balance(&self, wallet: WalletHandle) -> i128 {
        let Some(address) = self.wallets.get(&wallet).map(|w| &w.address) else {
            return 0;
        };
        self.transfers
            .values()
            .filter(|t| t.wallet == wallet && !t.state.is_terminal())
            .map(|t| {
                let source_owned = t.source.as_ref() == Some(address);
                let target_owned = t.target.as_ref() == Some(address);
                match (source_owned, target_owned) {
                    (false, true) => t.amount,
                    (true, false) if t.state.is_broadcast() => -(t.amount + t.fee),
                    (true, true) if t.state.is_broadcast() => -t.fee,
                    _ => 0,
                }
            })
            .sum()
    }

    fn announce_transfer_state(&self, transfer: TransferHandle) {
        let Some(t) = self.transfers.get(&transfer) else {
            return;
        };
        if let Some((manager, sink)) = self.wallet_sink(t.wallet) {
            sink.announce(EngineEvent::Transfer {
                manager,
                wallet: t.wallet,
                transfer,
                event: TransferCallback::Changed {
                    new: t.state.clone(),
                },
            });
        }
    }

    fn announce_wallet(&self, wallet: WalletHandle, event: WalletCallback) {
        if let Some((manager, sink)) = self.wallet_sink(wallet) {
            sink.announce(EngineEvent::Wallet {
                manager,
                wallet,
                event,
            });
        }
    }

    fn announce_balance(&self, wallet: WalletHandle) {
        let balance = self.balance(wallet);
        self.announce_wallet(wallet, WalletCallback::BalanceUpdated { balance });
    }

    fn announce_manager(&self, manager: ManagerHandle, event: ManagerCallback) {
        if let Some(sink) = self.sink(manager) {
            sink.announce(EngineEvent::Manager { manager, event });
        }
    }
}

/// Deterministic in-memory [`WalletEngine`]
pub struct SimulatedEngine {
    inner: Mutex<Inner>,
    next_handle: AtomicU64,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// An address on `network` that belongs to nobody in this engine
    pub fn counterparty(network: &Network, label: &str) -> Address {
        Chain::of(network).derive_address(network.uids(), &format!("counterparty:{}", label))
    }

    /// The network delivers `amount` base units from `from` into `wallet`; the transfer shows
    /// up pending
    pub fn receive(
        &self,
        wallet: WalletHandle,
        from: &Address,
        amount: i128,
    ) -> Option<TransferHandle> {
        let handle = TransferHandle(self.next());
        let mut inner = self.inner.lock();
        let w = inner.wallets.get(&wallet)?;
        let transfer = SimTransfer {
            wallet,
            source: Some(from.clone()),
            target: Some(w.address.clone()),
            amount,
            fee: 0,
            fee_basis: w.fee_basis.clone(),
            nonce: None,
            hash: Some(TransferHash::from_bytes(&Sha256::digest(
                format!("receive:{}:{}", handle.0, from).as_bytes(),
            ))),
            supersedes: None,
            state: TransferState::Pending,
        };
        inner.transfers.insert(handle, transfer);
        debug!("Simulated receipt {} of {} into {}", handle, amount, wallet);

        inner.announce_wallet(wallet, WalletCallback::TransferAdded { transfer: handle });
        inner.announce_balance(wallet);
        Some(handle)
    }

    /// The network includes `transfer` in `block_number`
    pub fn include(
        &self,
        transfer: TransferHandle,
        block_number: u64,
        transaction_index: u64,
        timestamp: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        let fee_unit = inner
            .transfers
            .get(&transfer)
            .and_then(|t| inner.wallets.get(&t.wallet))
            .and_then(|w| inner.managers.get(&w.manager))
            .map(|m| m.fee_unit.clone());
        let Some(t) = inner.transfers.get_mut(&transfer) else {
            return false;
        };
        if t.state.is_terminal() || t.state.confirmation().is_some() {
            return false;
        }
        t.state = TransferState::Included {
            confirmation: TransferConfirmation {
                block_number,
                transaction_index,
                timestamp,
                fee: fee_unit.map(|unit| Amount::from_base(t.fee, &unit)),
            },
        };
        let wallet = t.wallet;
        inner.announce_transfer_state(transfer);
        inner.announce_balance(wallet);
        true
    }

    /// The network rejects `transfer`
    pub fn fail(&self, transfer: TransferHandle, error: TransferSubmitError) -> bool {
        let mut inner = self.inner.lock();
        let Some(t) = inner.transfers.get_mut(&transfer) else {
            return false;
        };
        if t.state.is_terminal() {
            return false;
        }
        t.state = TransferState::Errored { error };
        let wallet = t.wallet;
        inner.announce_transfer_state(transfer);
        inner.announce_balance(wallet);
        true
    }

    /// The engine forgets `transfer`
    pub fn delete(&self, transfer: TransferHandle) -> bool {
        let mut inner = self.inner.lock();
        let Some(t) = inner.transfers.get_mut(&transfer) else {
            return false;
        };
        if t.state.is_deleted() {
            return false;
        }
        t.state = TransferState::Deleted;
        let wallet = t.wallet;
        inner.announce_wallet(wallet, WalletCallback::TransferDeleted { transfer });
        true
    }

    /// The engine drops `wallet` from its manager
    pub fn delete_wallet(&self, wallet: WalletHandle) -> bool {
        let inner = self.inner.lock();
        let Some(manager) = inner.wallets.get(&wallet).map(|w| w.manager) else {
            return false;
        };
        inner.announce_manager(manager, ManagerCallback::WalletDeleted { wallet });
        true
    }

    /// A new block arrived
    pub fn advance_height(&self, manager: ManagerHandle, height: u64) {
        let inner = self.inner.lock();
        inner.announce_manager(manager, ManagerCallback::BlockHeightUpdated { height });
    }

    /// Make the next submission fail with `error`
    pub fn fail_next_submit(&self, error: TransferSubmitError) {
        self.inner.lock().submit_failures.push_back(error);
    }

    fn new_transfer(
        &self,
        inner: &mut Inner,
        wallet: WalletHandle,
        transfer: SimTransfer,
    ) -> TransferHandle {
        let handle = TransferHandle(self.next());
        inner.transfers.insert(handle, transfer);
        inner.announce_wallet(wallet, WalletCallback::TransferAdded { transfer: handle });
        handle
    }
}

impl WalletEngine for SimulatedEngine {
    fn create_manager(
        &self,
        sink: EngineEventSink,
        account: &Account,
        network: &Arc<Network>,
        mode: WalletManagerMode,
        _path: &str,
    ) -> Result<ManagerHandle> {
        let chain = Chain::of(network);
        let currency = network.currency().clone();
        let fee_unit = network
            .base_unit_for(&currency)
            .cloned()
            .ok_or_else(|| Error::UnitNotFound {
                currency: currency.code().to_string(),
                unit: "base".to_string(),
            })?;

        let manager = ManagerHandle(self.next());
        let wallet = WalletHandle(self.next());
        let address = chain.derive_address(network.uids(), account.uids());
        info!(
            "Simulated {} on {} in {} mode, receiving at {}",
            manager, network, mode, address
        );

        let mut inner = self.inner.lock();
        inner.wallets.insert(
            wallet,
            SimWallet {
                manager,
                currency,
                address,
                fee_basis: chain.default_fee_basis(&fee_unit),
                next_nonce: 0,
            },
        );
        inner.managers.insert(
            manager,
            SimManager {
                sink,
                network: network.clone(),
                chain,
                fee_unit,
                primary: wallet,
                connected: false,
            },
        );
        inner.announce_manager(manager, ManagerCallback::WalletAdded { wallet });
        Ok(manager)
    }

    fn primary_wallet(&self, manager: ManagerHandle) -> Option<WalletHandle> {
        self.inner.lock().managers.get(&manager).map(|m| m.primary)
    }

    fn connect(&self, manager: ManagerHandle) {
        let mut inner = self.inner.lock();
        let Some(m) = inner.managers.get_mut(&manager) else {
            return;
        };
        if m.connected {
            return;
        }
        m.connected = true;
        debug!("{} connected to {}", manager, m.network);
        inner.announce_manager(
            manager,
            ManagerCallback::Changed {
                new: WalletManagerState::Connected,
            },
        );
    }

    fn disconnect(&self, manager: ManagerHandle) {
        let mut inner = self.inner.lock();
        let Some(m) = inner.managers.get_mut(&manager) else {
            return;
        };
        if !m.connected {
            return;
        }
        m.connected = false;
        inner.announce_manager(
            manager,
            ManagerCallback::Changed {
                new: WalletManagerState::Disconnected,
            },
        );
    }

    fn sync(&self, manager: ManagerHandle) {
        let inner = self.inner.lock();
        let Some(connected) = inner.managers.get(&manager).map(|m| m.connected) else {
            return;
        };
        if !connected {
            inner.announce_manager(manager, ManagerCallback::SyncStarted);
            inner.announce_manager(
                manager,
                ManagerCallback::SyncEnded {
                    error: Some("not connected".to_string()),
                },
            );
            return;
        }
        let sequence = [
            ManagerCallback::Changed {
                new: WalletManagerState::Syncing,
            },
            ManagerCallback::SyncStarted,
            ManagerCallback::SyncProgress { percent: 50.0 },
            ManagerCallback::SyncProgress { percent: 100.0 },
            ManagerCallback::SyncEnded { error: None },
            ManagerCallback::Changed {
                new: WalletManagerState::Connected,
            },
        ];
        for event in sequence {
            inner.announce_manager(manager, event);
        }
    }

    fn submit(
        &self,
        _manager: ManagerHandle,
        wallet: WalletHandle,
        transfer: TransferHandle,
        paper_key: &str,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(t) = inner.transfers.get_mut(&transfer) else {
            warn!("Cannot submit unknown {}", transfer);
            return;
        };
        if t.state != TransferState::Created {
            warn!("{} was already submitted ({})", transfer, t.state);
            return;
        }

        if paper_key.trim().is_empty() {
            t.state = TransferState::Errored {
                error: TransferSubmitError::InvalidSignature,
            };
            inner.announce_transfer_state(transfer);
            inner.announce_wallet(
                wallet,
                WalletCallback::TransferSubmitted {
                    transfer,
                    success: false,
                },
            );
            return;
        }

        let digest = Sha256::digest(
            format!(
                "{}|{}|{:?}|{:?}|{}",
                paper_key, transfer.0, t.nonce, t.target, t.amount
            )
            .as_bytes(),
        );
        t.hash = Some(TransferHash::from_bytes(&digest));
        t.state = TransferState::Signed;
        let supersedes = t.supersedes;
        inner.announce_transfer_state(transfer);

        let outcome = inner.submit_failures.pop_front();
        let success = outcome.is_none();
        if let Some(t) = inner.transfers.get_mut(&transfer) {
            t.state = match outcome {
                Some(error) => TransferState::Errored { error },
                None => TransferState::Submitted,
            };
        }
        if success {
            if let Some((original, kind)) = supersedes {
                if let Some(o) = inner.transfers.get_mut(&original) {
                    if !o.state.is_terminal() && o.state.confirmation().is_none() {
                        o.state = kind.superseded_state();
                    }
                }
            }
        }
        inner.announce_transfer_state(transfer);
        inner.announce_wallet(wallet, WalletCallback::TransferSubmitted { transfer, success });
        if success {
            inner.announce_balance(wallet);
        }
    }

    fn wallet_currency(&self, wallet: WalletHandle) -> Option<String> {
        self.inner
            .lock()
            .wallets
            .get(&wallet)
            .map(|w| w.currency.uids().to_string())
    }

    fn wallet_address(&self, wallet: WalletHandle) -> Option<Address> {
        self.inner
            .lock()
            .wallets
            .get(&wallet)
            .map(|w| w.address.clone())
    }

    fn wallet_owns_address(&self, wallet: WalletHandle, address: &Address) -> bool {
        self.inner
            .lock()
            .wallets
            .get(&wallet)
            .map(|w| w.address == *address)
            .unwrap_or(false)
    }

    fn wallet_balance(&self, wallet: WalletHandle) -> i128 {
        self.inner.lock().balance(wallet)
    }

    fn wallet_default_fee_basis(&self, wallet: WalletHandle) -> Option<TransferFeeBasis> {
        self.inner
            .lock()
            .wallets
            .get(&wallet)
            .map(|w| w.fee_basis.clone())
    }

    fn set_wallet_default_fee_basis(&self, wallet: WalletHandle, fee_basis: &TransferFeeBasis) {
        if let Some(w) = self.inner.lock().wallets.get_mut(&wallet) {
            w.fee_basis = fee_basis.clone();
        }
    }

    fn estimate_fee(
        &self,
        wallet: WalletHandle,
        _amount: &Amount,
        fee_basis: Option<&TransferFeeBasis>,
    ) -> i128 {
        let inner = self.inner.lock();
        match fee_basis {
            Some(fee_basis) => fee_of(fee_basis),
            None => inner
                .wallets
                .get(&wallet)
                .map(|w| fee_of(&w.fee_basis))
                .unwrap_or(0),
        }
    }

    fn create_transfer(
        &self,
        wallet: WalletHandle,
        target: &Address,
        amount: &Amount,
        fee_basis: Option<&TransferFeeBasis>,
    ) -> Option<TransferHandle> {
        let mut inner = self.inner.lock();
        let chain = inner.chain_of(wallet)?;
        let w = inner.wallets.get(&wallet)?;
        if !amount.has_currency(&w.currency) || amount.is_negative() {
            return None;
        }
        if !chain.is_valid(target) {
            debug!("Rejecting transfer to invalid address {}", target);
            return None;
        }
        let fee_basis = fee_basis.cloned().unwrap_or_else(|| w.fee_basis.clone());
        let fee = fee_of(&fee_basis);
        let source = w.address.clone();
        let balance = inner.balance(wallet);
        if amount.value() + fee > balance {
            debug!(
                "Rejecting transfer of {} + fee {}: balance is {}",
                amount.value(),
                fee,
                balance
            );
            return None;
        }

        let nonce = match chain {
            Chain::Ethereum => inner.wallets.get_mut(&wallet).map(|w| {
                let nonce = w.next_nonce;
                w.next_nonce += 1;
                nonce
            }),
            Chain::Bitcoin => None,
        };
        let transfer = SimTransfer {
            wallet,
            source: Some(source),
            target: Some(target.clone()),
            amount: amount.value(),
            fee,
            fee_basis,
            nonce,
            hash: None,
            supersedes: None,
            state: TransferState::Created,
        };
        Some(self.new_transfer(&mut inner, wallet, transfer))
    }

    fn create_transfer_to_replace(
        &self,
        wallet: WalletHandle,
        original: TransferHandle,
        options: ReplaceOptions,
    ) -> Option<TransferHandle> {
        let mut inner = self.inner.lock();
        let chain = inner.chain_of(wallet)?;
        let o = inner.transfers.get(&original)?;
        if o.wallet != wallet || !replaceable(&o.state) {
            return None;
        }
        let fee_basis = bumped(&o.fee_basis, options);
        let (source, target, amount, nonce) =
            (o.source.clone(), o.target.clone(), o.amount, o.nonce);

        let nonce = if options.update_nonce && chain == Chain::Ethereum {
            inner.wallets.get_mut(&wallet).map(|w| {
                let nonce = w.next_nonce;
                w.next_nonce += 1;
                nonce
            })
        } else {
            nonce
        };
        let transfer = SimTransfer {
            wallet,
            source,
            target,
            amount,
            fee: fee_of(&fee_basis),
            fee_basis,
            nonce,
            hash: None,
            supersedes: Some((original, ReplacementKind::Replace)),
            state: TransferState::Created,
        };
        Some(self.new_transfer(&mut inner, wallet, transfer))
    }

    fn create_transfer_to_cancel(
        &self,
        wallet: WalletHandle,
        original: TransferHandle,
    ) -> Option<TransferHandle> {
        let mut inner = self.inner.lock();
        let address = inner.wallets.get(&wallet)?.address.clone();
        let o = inner.transfers.get(&original)?;
        if o.wallet != wallet || !replaceable(&o.state) {
            return None;
        }
        let fee_basis = bumped(
            &o.fee_basis,
            ReplaceOptions {
                update_gas_price: true,
                ..ReplaceOptions::default()
            },
        );
        let transfer = SimTransfer {
            wallet,
            source: Some(address.clone()),
            target: Some(address),
            amount: 0,
            fee: fee_of(&fee_basis),
            fee_basis,
            nonce: o.nonce,
            hash: None,
            supersedes: Some((original, ReplacementKind::Cancel)),
            state: TransferState::Created,
        };
        Some(self.new_transfer(&mut inner, wallet, transfer))
    }

    fn transfer_source(&self, transfer: TransferHandle) -> Option<Address> {
        self.inner.lock().transfers.get(&transfer)?.source.clone()
    }

    fn transfer_target(&self, transfer: TransferHandle) -> Option<Address> {
        self.inner.lock().transfers.get(&transfer)?.target.clone()
    }

    fn transfer_amount(&self, transfer: TransferHandle) -> i128 {
        self.inner
            .lock()
            .transfers
            .get(&transfer)
            .map(|t| t.amount)
            .unwrap_or(0)
    }

    fn transfer_fee(&self, transfer: TransferHandle) -> i128 {
        self.inner
            .lock()
            .transfers
            .get(&transfer)
            .map(|t| t.fee)
            .unwrap_or(0)
    }

    fn transfer_fee_basis(&self, transfer: TransferHandle) -> Option<TransferFeeBasis> {
        self.inner
            .lock()
            .transfers
            .get(&transfer)
            .map(|t| t.fee_basis.clone())
    }

    fn transfer_hash(&self, transfer: TransferHandle) -> Option<TransferHash> {
        self.inner.lock().transfers.get(&transfer)?.hash.clone()
    }

    fn transfer_nonce(&self, transfer: TransferHandle) -> Option<u64> {
        self.inner.lock().transfers.get(&transfer)?.nonce
    }

    fn transfer_state(&self, transfer: TransferHandle) -> Option<TransferState> {
        self.inner
            .lock()
            .transfers
            .get(&transfer)
            .map(|t| t.state.clone())
    }
}
