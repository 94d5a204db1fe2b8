use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use dn_types::{ChainId, EventKind};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("no wallet provider available")]
    NoProvider,
    #[error("request rejected by the user")]
    UserRejected,
    #[error("contract call failed: {0}")]
    CallFailed(String),
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

pub type ChainResult<T> = Result<T, ChainError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderNotification {
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    Donated {
        donor: Address,
        amount: U256,
        tx_hash: B256,
    },
    Withdrawn {
        recipient: Address,
        amount: U256,
        tx_hash: B256,
    },
}

impl ContractEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ContractEvent::Donated { .. } => EventKind::Donated,
            ContractEvent::Withdrawn { .. } => EventKind::Withdrawn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
}

/// A stream of notifications from a collaborator. Dropping the handle (or
/// calling [`Subscription::unsubscribe`]) removes the listener.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next item, or `None` once the producer side has gone away.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.cancel_listener();
    }

    fn cancel_listener(&mut self) {
        self.receiver.close();
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.cancel_listener();
    }
}

/// The user's signing agent: account access, network identity and change
/// notifications.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn request_accounts(&self) -> ChainResult<Vec<Address>>;
    async fn chain_id(&self) -> ChainResult<ChainId>;
    /// Address of the account that will sign transactions.
    async fn signer(&self) -> ChainResult<Address>;
    fn subscribe_notifications(&self) -> Subscription<ProviderNotification>;
}

/// View calls against the donation contract.
#[async_trait]
pub trait ContractReader: Send + Sync {
    async fn owner(&self) -> ChainResult<Address>;
    async fn min_donation_wei(&self) -> ChainResult<U256>;
    async fn total_donated(&self) -> ChainResult<U256>;
    async fn donated_by(&self, account: Address) -> ChainResult<U256>;
    async fn charities_count(&self) -> ChainResult<u64>;
    async fn charity_at(&self, index: u64) -> ChainResult<Address>;
    async fn charity_name(&self, charity: Address) -> ChainResult<String>;
    async fn charity_balance_wei(&self, charity: Address) -> ChainResult<U256>;
    /// Native balance held by the contract itself.
    async fn contract_balance(&self) -> ChainResult<U256>;
}

#[async_trait]
pub trait PendingTransaction: Send + Sync {
    fn tx_hash(&self) -> B256;
    /// Resolves once the transaction has one confirmation.
    async fn wait(&self) -> ChainResult<TxReceipt>;
}

#[async_trait]
pub trait ContractWriter: Send + Sync {
    async fn donate_to_charity(
        &self,
        from: Address,
        charity: Address,
        value: U256,
    ) -> ChainResult<Box<dyn PendingTransaction>>;

    async fn withdraw(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> ChainResult<Box<dyn PendingTransaction>>;
}

#[async_trait]
pub trait ContractEvents: Send + Sync {
    /// `Donated` and `Withdrawn` events on one stream, in the order the chain
    /// produced them.
    async fn subscribe_events(&self) -> ChainResult<Subscription<ContractEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn subscription_cancels_once_on_drop() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let counter = cancelled.clone();
        let mut subscription = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(7).unwrap();
        assert_eq!(subscription.recv().await, Some(7));

        subscription.unsubscribe();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(tx.send(8).is_err());
    }

    #[test]
    fn contract_event_reports_kind() {
        let event = ContractEvent::Withdrawn {
            recipient: Address::ZERO,
            amount: U256::from(1),
            tx_hash: B256::ZERO,
        };
        assert_eq!(event.kind(), EventKind::Withdrawn);
    }
}
