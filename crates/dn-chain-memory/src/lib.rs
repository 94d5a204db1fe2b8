//! Deterministic in-process donation contract and wallet.
//!
//! Implements every capability trait from `dn-chain-client` against shared
//! in-memory state. Knobs on [`InMemoryChain`] let callers hold confirmations,
//! force reverts, fail individual reads and push provider notifications.

use alloy_primitives::{Address, B256, U256, keccak256};
use async_trait::async_trait;
use dn_chain_client::{
    ChainError, ChainResult, ContractEvent, ContractEvents, ContractReader, ContractWriter,
    PendingTransaction, ProviderNotification, Subscription, TxReceipt, WalletProvider,
};
use dn_types::ChainId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone)]
struct CharityRecord {
    address: Address,
    name: Option<String>,
    balance: U256,
}

#[derive(Default)]
struct ChainState {
    accounts: Vec<Address>,
    chain_id: ChainId,
    decline_connection: bool,
    owner: Address,
    min_donation: U256,
    total_donated: U256,
    donated_by: HashMap<Address, U256>,
    contract_balance: U256,
    charities: Vec<CharityRecord>,
    reported_charity_count: Option<u64>,
    failing_names: HashSet<Address>,
    failing_balances: HashSet<Address>,
    fail_core_reads: bool,
    revert_next: Option<String>,
    write_calls: usize,
    block_number: u64,
    tx_nonce: u64,
    next_listener_id: u64,
    event_listeners: Vec<(u64, mpsc::UnboundedSender<ContractEvent>)>,
    notification_listeners: Vec<(u64, mpsc::UnboundedSender<ProviderNotification>)>,
}

struct Inner {
    state: Mutex<ChainState>,
    confirmations_held: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct InMemoryChain {
    inner: Arc<Inner>,
}

impl InMemoryChain {
    /// A chain with one unlocked `account` that also owns the contract.
    pub fn new(chain_id: ChainId, account: Address) -> Self {
        let (confirmations_held, _) = watch::channel(false);
        let state = ChainState {
            accounts: vec![account],
            chain_id,
            owner: account,
            ..ChainState::default()
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                confirmations_held,
            }),
        }
    }

    /// Pre-populated chain used by the CLI's simulate mode.
    pub fn demo(chain_id: ChainId) -> Self {
        let chain = Self::new(chain_id, Address::repeat_byte(0xa1));
        chain.set_min_donation(U256::from(1_000_000_000_000_000u64));
        chain.add_charity(Address::repeat_byte(0x11), Some("Clean Water Fund"), U256::ZERO);
        chain.add_charity(Address::repeat_byte(0x22), Some("Open Books"), U256::ZERO);
        chain.add_charity(Address::repeat_byte(0x33), None, U256::ZERO);
        chain
    }

    pub fn set_owner(&self, owner: Address) {
        self.inner.lock().owner = owner;
    }

    pub fn set_min_donation(&self, min: U256) {
        self.inner.lock().min_donation = min;
    }

    pub fn set_contract_balance(&self, balance: U256) {
        self.inner.lock().contract_balance = balance;
    }

    pub fn add_charity(&self, address: Address, name: Option<&str>, balance: U256) {
        self.inner.lock().charities.push(CharityRecord {
            address,
            name: name.map(ToOwned::to_owned),
            balance,
        });
    }

    pub fn remove_charity(&self, address: Address) {
        self.inner.lock().charities.retain(|c| c.address != address);
    }

    /// Overrides the value `charitiesCount()` returns. `None` reports the
    /// real registry length.
    pub fn report_charity_count(&self, count: Option<u64>) {
        self.inner.lock().reported_charity_count = count;
    }

    pub fn fail_name_read(&self, charity: Address) {
        self.inner.lock().failing_names.insert(charity);
    }

    pub fn fail_balance_read(&self, charity: Address) {
        self.inner.lock().failing_balances.insert(charity);
    }

    /// Makes every contract-level scalar read fail until turned off.
    pub fn set_core_reads_failing(&self, failing: bool) {
        self.inner.lock().fail_core_reads = failing;
    }

    pub fn decline_connections(&self, decline: bool) {
        self.inner.lock().decline_connection = decline;
    }

    /// The next submitted transaction reverts on confirmation.
    pub fn revert_next(&self, reason: &str) {
        self.inner.lock().revert_next = Some(reason.to_owned());
    }

    /// Pending transactions stay unconfirmed until [`Self::release_confirmations`].
    pub fn hold_confirmations(&self) {
        self.inner.confirmations_held.send_replace(true);
    }

    pub fn release_confirmations(&self) {
        self.inner.confirmations_held.send_replace(false);
    }

    pub fn write_calls(&self) -> usize {
        self.inner.lock().write_calls
    }

    pub fn event_listener_count(&self) -> usize {
        self.inner.lock().event_listeners.len()
    }

    pub fn notification_listener_count(&self) -> usize {
        self.inner.lock().notification_listeners.len()
    }

    pub fn switch_account(&self, account: Address) {
        let mut state = self.inner.lock();
        state.accounts = vec![account];
        let notification = ProviderNotification::AccountsChanged(state.accounts.clone());
        broadcast_notification(&mut state, notification);
    }

    pub fn switch_chain(&self, chain_id: ChainId) {
        let mut state = self.inner.lock();
        state.chain_id = chain_id;
        broadcast_notification(&mut state, ProviderNotification::ChainChanged(chain_id));
    }

    /// Delivers an event to every event listener, as if a block had
    /// included it.
    pub fn emit(&self, event: ContractEvent) {
        let mut state = self.inner.lock();
        emit_event(&mut state, event);
    }

    fn next_tx_hash(state: &mut ChainState) -> B256 {
        state.tx_nonce += 1;
        keccak256(state.tx_nonce.to_be_bytes())
    }

    fn submit(&self, effect: Effect) -> Box<dyn PendingTransaction> {
        let mut state = self.inner.lock();
        state.write_calls += 1;
        let tx_hash = Self::next_tx_hash(&mut state);
        let revert = state.revert_next.take();
        debug!(%tx_hash, ?effect, "in-memory transaction submitted");

        Box::new(MemoryPendingTx {
            inner: self.inner.clone(),
            tx_hash,
            outcome: Mutex::new(Some(PendingOutcome { effect, revert })),
            receipt: Mutex::new(None),
        })
    }

    fn core_read<T>(&self, read: impl FnOnce(&ChainState) -> T) -> ChainResult<T> {
        let state = self.inner.lock();
        if state.fail_core_reads {
            return Err(ChainError::Rpc("node unavailable".to_owned()));
        }
        Ok(read(&state))
    }
}

fn broadcast_notification(state: &mut ChainState, notification: ProviderNotification) {
    state
        .notification_listeners
        .retain(|(_, sender)| sender.send(notification.clone()).is_ok());
}

fn emit_event(state: &mut ChainState, event: ContractEvent) {
    state.block_number += 1;
    state
        .event_listeners
        .retain(|(_, sender)| sender.send(event.clone()).is_ok());
}

#[derive(Debug, Clone)]
enum Effect {
    Donate {
        from: Address,
        charity: Address,
        value: U256,
    },
    Withdraw {
        from: Address,
        to: Address,
        amount: U256,
    },
}

struct PendingOutcome {
    effect: Effect,
    revert: Option<String>,
}

struct MemoryPendingTx {
    inner: Arc<Inner>,
    tx_hash: B256,
    outcome: Mutex<Option<PendingOutcome>>,
    receipt: Mutex<Option<ChainResult<TxReceipt>>>,
}

impl MemoryPendingTx {
    fn settle(&self) -> ChainResult<TxReceipt> {
        let mut receipt = self.receipt.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(settled) = receipt.as_ref() {
            return settled.clone();
        }

        let outcome = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match outcome {
            Some(outcome) => self.apply(outcome),
            None => Err(ChainError::Rpc("transaction outcome lost".to_owned())),
        };
        *receipt = Some(result.clone());
        result
    }

    fn apply(&self, outcome: PendingOutcome) -> ChainResult<TxReceipt> {
        if let Some(reason) = outcome.revert {
            return Err(ChainError::Reverted(reason));
        }

        let mut state = self.inner.lock();
        let event = match outcome.effect {
            Effect::Donate {
                from,
                charity,
                value,
            } => {
                if !state.min_donation.is_zero() && value < state.min_donation {
                    return Err(ChainError::Reverted("donation below minimum".to_owned()));
                }
                let Some(record) = state.charities.iter_mut().find(|c| c.address == charity) else {
                    return Err(ChainError::Reverted("unknown charity".to_owned()));
                };
                record.balance += value;
                state.total_donated += value;
                state.contract_balance += value;
                *state.donated_by.entry(from).or_default() += value;
                ContractEvent::Donated {
                    donor: from,
                    amount: value,
                    tx_hash: self.tx_hash,
                }
            }
            Effect::Withdraw { from, to, amount } => {
                if from != state.owner {
                    return Err(ChainError::Reverted("caller is not the owner".to_owned()));
                }
                if amount > state.contract_balance {
                    return Err(ChainError::Reverted("insufficient contract balance".to_owned()));
                }
                state.contract_balance -= amount;
                ContractEvent::Withdrawn {
                    recipient: to,
                    amount,
                    tx_hash: self.tx_hash,
                }
            }
        };

        emit_event(&mut state, event);
        Ok(TxReceipt {
            tx_hash: self.tx_hash,
            block_number: state.block_number,
        })
    }
}

#[async_trait]
impl PendingTransaction for MemoryPendingTx {
    fn tx_hash(&self) -> B256 {
        self.tx_hash
    }

    async fn wait(&self) -> ChainResult<TxReceipt> {
        let mut held = self.inner.confirmations_held.subscribe();
        let released = held.wait_for(|held| !*held).await.is_ok();
        if !released {
            return Err(ChainError::Rpc("confirmation channel closed".to_owned()));
        }
        self.settle()
    }
}

#[async_trait]
impl WalletProvider for InMemoryChain {
    async fn request_accounts(&self) -> ChainResult<Vec<Address>> {
        let state = self.inner.lock();
        if state.decline_connection {
            return Err(ChainError::UserRejected);
        }
        Ok(state.accounts.clone())
    }

    async fn chain_id(&self) -> ChainResult<ChainId> {
        Ok(self.inner.lock().chain_id)
    }

    async fn signer(&self) -> ChainResult<Address> {
        self.inner
            .lock()
            .accounts
            .first()
            .copied()
            .ok_or_else(|| ChainError::Rpc("no unlocked account".to_owned()))
    }

    fn subscribe_notifications(&self) -> Subscription<ProviderNotification> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.lock();
            state.next_listener_id += 1;
            let id = state.next_listener_id;
            state.notification_listeners.push((id, sender));
            id
        };

        let inner = self.inner.clone();
        Subscription::new(receiver, move || {
            inner.lock().notification_listeners.retain(|(listener, _)| *listener != id);
        })
    }
}

#[async_trait]
impl ContractReader for InMemoryChain {
    async fn owner(&self) -> ChainResult<Address> {
        self.core_read(|state| state.owner)
    }

    async fn min_donation_wei(&self) -> ChainResult<U256> {
        self.core_read(|state| state.min_donation)
    }

    async fn total_donated(&self) -> ChainResult<U256> {
        self.core_read(|state| state.total_donated)
    }

    async fn donated_by(&self, account: Address) -> ChainResult<U256> {
        self.core_read(|state| state.donated_by.get(&account).copied().unwrap_or_default())
    }

    async fn charities_count(&self) -> ChainResult<u64> {
        let state = self.inner.lock();
        Ok(state
            .reported_charity_count
            .unwrap_or(state.charities.len() as u64))
    }

    async fn charity_at(&self, index: u64) -> ChainResult<Address> {
        let state = self.inner.lock();
        usize::try_from(index)
            .ok()
            .and_then(|index| state.charities.get(index))
            .map(|c| c.address)
            .ok_or_else(|| ChainError::CallFailed(format!("charity index {index} out of range")))
    }

    async fn charity_name(&self, charity: Address) -> ChainResult<String> {
        let state = self.inner.lock();
        if state.failing_names.contains(&charity) {
            return Err(ChainError::CallFailed("charityName reverted".to_owned()));
        }
        Ok(state
            .charities
            .iter()
            .find(|c| c.address == charity)
            .and_then(|c| c.name.clone())
            .unwrap_or_default())
    }

    async fn charity_balance_wei(&self, charity: Address) -> ChainResult<U256> {
        let state = self.inner.lock();
        if state.failing_balances.contains(&charity) {
            return Err(ChainError::CallFailed("charityBalanceWei reverted".to_owned()));
        }
        Ok(state
            .charities
            .iter()
            .find(|c| c.address == charity)
            .map(|c| c.balance)
            .unwrap_or_default())
    }

    async fn contract_balance(&self) -> ChainResult<U256> {
        self.core_read(|state| state.contract_balance)
    }
}

#[async_trait]
impl ContractWriter for InMemoryChain {
    async fn donate_to_charity(
        &self,
        from: Address,
        charity: Address,
        value: U256,
    ) -> ChainResult<Box<dyn PendingTransaction>> {
        Ok(self.submit(Effect::Donate {
            from,
            charity,
            value,
        }))
    }

    async fn withdraw(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> ChainResult<Box<dyn PendingTransaction>> {
        Ok(self.submit(Effect::Withdraw { from, to, amount }))
    }
}

#[async_trait]
impl ContractEvents for InMemoryChain {
    async fn subscribe_events(&self) -> ChainResult<Subscription<ContractEvent>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.lock();
            state.next_listener_id += 1;
            let id = state.next_listener_id;
            state.event_listeners.push((id, sender));
            id
        };

        let inner = self.inner.clone();
        Ok(Subscription::new(receiver, move || {
            inner.lock().event_listeners.retain(|(listener, _)| *listener != id);
        }))
    }
}
