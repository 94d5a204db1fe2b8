//! Chain state synchronization and transaction lifecycle for the charity
//! donation contract.
//!
//! [`DonationDapp`] wires the wallet session, the contract state aggregator,
//! the transaction executor and the event subscriptions together over the
//! capability traits from `dn-chain-client`.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod notify;
pub mod selection;
pub mod session;

#[cfg(test)]
mod testing;

pub use aggregator::ContractStateAggregator;
pub use config::{ConfigError, DappConfig};
pub use error::DappError;
pub use events::{EVENT_LOG_CAPACITY, EventLog, EventSubscriptionManager};
pub use executor::{TransactionExecutor, TransactionRequest};
pub use notify::{MemoryNotifier, Notice, NoticeLevel, Notifier, TracingNotifier};
pub use selection::SelectionReconciler;
pub use session::{Identity, SessionState, SessionStatus, WalletSession};

use alloy_primitives::Address;
use dn_chain_client::{
    ContractEvents, ContractReader, ContractWriter, ProviderNotification, Subscription, TxReceipt,
    WalletProvider,
};
use dn_types::{CharityEntity, ContractSnapshot, EventRecord, parse_address, short_address};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// The chain-facing collaborators a [`DonationDapp`] runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub wallet: Option<Arc<dyn WalletProvider>>,
    pub reader: Arc<dyn ContractReader>,
    pub writer: Arc<dyn ContractWriter>,
    pub events: Arc<dyn ContractEvents>,
}

impl Capabilities {
    pub fn from_chain<C>(chain: C) -> Self
    where
        C: WalletProvider + ContractReader + ContractWriter + ContractEvents + 'static,
    {
        let chain = Arc::new(chain);
        Self {
            wallet: Some(chain.clone()),
            reader: chain.clone(),
            writer: chain.clone(),
            events: chain,
        }
    }

    pub fn without_wallet(self) -> Self {
        Self {
            wallet: None,
            ..self
        }
    }
}

pub struct DonationDapp {
    config: DappConfig,
    session: WalletSession,
    aggregator: Arc<ContractStateAggregator>,
    executor: TransactionExecutor,
    events: EventSubscriptionManager,
    notifier: Arc<dyn Notifier>,
}

impl DonationDapp {
    pub fn new(config: DappConfig, capabilities: Capabilities, notifier: Arc<dyn Notifier>) -> Self {
        let aggregator = Arc::new(ContractStateAggregator::new(capabilities.reader));
        Self {
            config,
            session: WalletSession::new(capabilities.wallet, config.required_chain_id),
            executor: TransactionExecutor::new(capabilities.writer, aggregator.clone(), notifier.clone()),
            events: EventSubscriptionManager::new(capabilities.events),
            aggregator,
            notifier,
        }
    }

    pub fn config(&self) -> &DappConfig {
        &self.config
    }

    pub fn session(&self) -> &WalletSession {
        &self.session
    }

    pub fn executor(&self) -> &TransactionExecutor {
        &self.executor
    }

    pub async fn snapshot(&self) -> ContractSnapshot {
        self.aggregator.snapshot().await
    }

    pub async fn charities(&self) -> Vec<CharityEntity> {
        self.aggregator.charities().await
    }

    pub async fn selected_charity(&self) -> Option<Address> {
        self.aggregator.selected_charity().await
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.entries().await
    }

    pub async fn is_owner(&self) -> bool {
        match self.session.identity().await {
            Some(identity) => self.aggregator.is_owner(identity.account).await,
            None => false,
        }
    }

    /// Connects the wallet. On the required network this also starts event
    /// delivery and loads contract state; on any other outcome nothing is
    /// read from the contract.
    pub async fn connect(&self) -> Result<Identity, DappError> {
        let identity = match self.session.connect().await {
            Ok(identity) => identity,
            Err(err @ DappError::WrongNetwork { .. }) => {
                self.notifier.notify(Notice::new(NoticeLevel::Warning, err.to_string()));
                return Err(err);
            }
            Err(err) => return Err(self.report(err)),
        };

        self.notifier.notify(Notice::new(
            NoticeLevel::Success,
            format!("Connected as {}", short_address(&identity.account)),
        ));

        if let Err(err) = self.events.activate(identity).await {
            self.report(err);
        }
        if let Err(err) = self.aggregator.refresh_all(&identity).await {
            self.report(err);
        }
        Ok(identity)
    }

    pub async fn refresh(&self) -> Result<(), DappError> {
        let identity = self.require_identity().await?;
        match self.aggregator.refresh_all(&identity).await {
            Ok(()) => {
                self.notifier.notify(Notice::new(NoticeLevel::Success, "Updated"));
                Ok(())
            }
            Err(err) => Err(self.report(err)),
        }
    }

    pub async fn select_charity(&self, charity: &str) -> Result<(), DappError> {
        let outcome = match parse_address(charity) {
            Some(address) => self.aggregator.select_charity(address).await,
            None => Err(DappError::InvalidAddress(charity.to_owned())),
        };
        outcome.map_err(|err| self.report(err))
    }

    pub async fn donate(&self, charity: &str, amount: &str) -> Result<TxReceipt, DappError> {
        let identity = self.require_identity().await?;
        self.executor
            .donate(&identity, charity, amount)
            .await
            .map_err(|err| self.report(err))
    }

    /// Donates to the currently selected charity.
    pub async fn donate_to_selected(&self, amount: &str) -> Result<TxReceipt, DappError> {
        let Some(charity) = self.aggregator.selected_charity().await else {
            return Err(self.report(DappError::InvalidAddress(String::new())));
        };
        self.donate(&charity.to_checksum(None), amount).await
    }

    pub async fn withdraw(&self, recipient: &str, amount: &str) -> Result<TxReceipt, DappError> {
        let identity = self.require_identity().await?;
        self.executor
            .withdraw(&identity, recipient, amount)
            .await
            .map_err(|err| self.report(err))
    }

    pub fn subscribe_notifications(&self) -> Option<Subscription<ProviderNotification>> {
        self.session.subscribe_notifications()
    }

    /// Any account or network change invalidates everything read so far.
    /// The caller has to [`Self::connect`] again.
    pub async fn handle_notification(&self, notification: ProviderNotification) {
        info!(?notification, "wallet identity changed");
        self.session.reset().await;
        self.events.deactivate().await;
        self.aggregator.reset().await;

        let text = match notification {
            ProviderNotification::AccountsChanged(_) => "Wallet account changed, please reconnect".to_owned(),
            ProviderNotification::ChainChanged(chain_id) => {
                format!("Wallet switched to chain {chain_id}, please reconnect")
            }
        };
        self.notifier.notify(Notice::new(NoticeLevel::Warning, text));
    }

    /// Feeds provider notifications into [`Self::handle_notification`] until
    /// the returned task is aborted. `None` without a wallet.
    pub fn spawn_provider_watch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut notifications = self.subscribe_notifications()?;
        let dapp = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                dapp.handle_notification(notification).await;
            }
        }))
    }

    pub async fn shutdown(&self) {
        self.events.deactivate().await;
    }

    async fn require_identity(&self) -> Result<Identity, DappError> {
        match self.session.identity().await {
            Some(identity) => Ok(identity),
            None => Err(self.report(DappError::NotConnectedOrWrongNetwork)),
        }
    }

    /// Surfaces `err` as an error notice. Transaction failures were already
    /// reported under their own key.
    fn report(&self, err: DappError) -> DappError {
        if !matches!(err, DappError::TransactionFailed(_)) {
            self.notifier.notify(Notice::new(NoticeLevel::Error, err.to_string()));
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CHAIN, account, chain_with_charities, charity, wait_until};
    use alloy_primitives::U256;
    use dn_chain_memory::InMemoryChain;
    use dn_types::{ChainId, EventKind, TxKind};

    struct Harness {
        chain: InMemoryChain,
        notifier: Arc<MemoryNotifier>,
        dapp: Arc<DonationDapp>,
    }

    fn harness(chain: InMemoryChain) -> Harness {
        let config = DappConfig {
            contract_address: Address::repeat_byte(0xcc),
            required_chain_id: CHAIN,
        };
        let notifier = Arc::new(MemoryNotifier::default());
        let dapp = Arc::new(DonationDapp::new(
            config,
            Capabilities::from_chain(chain.clone()),
            notifier.clone(),
        ));
        Harness { chain, notifier, dapp }
    }

    #[tokio::test]
    async fn connect_loads_state_and_starts_events() -> anyhow::Result<()> {
        let chain = chain_with_charities(3);
        chain.set_min_donation(U256::from(10));
        let h = harness(chain);

        let identity = h.dapp.connect().await?;
        assert_eq!(identity.account, account());
        assert_eq!(h.dapp.snapshot().await.min_donation_wei, U256::from(10));
        assert_eq!(h.dapp.charities().await.len(), 3);
        assert_eq!(h.dapp.selected_charity().await, Some(charity(1)));
        assert!(h.dapp.is_owner().await);
        assert_eq!(h.chain.event_listener_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_network_reads_nothing() {
        let chain = InMemoryChain::new(ChainId(5), account());
        chain.add_charity(charity(1), Some("Shelter"), U256::ZERO);
        chain.set_min_donation(U256::from(10));
        let h = harness(chain);

        let err = h.dapp.connect().await.unwrap_err();
        assert_eq!(
            err,
            DappError::WrongNetwork {
                required: CHAIN,
                actual: ChainId(5)
            }
        );
        assert!(!h.dapp.session().enabled().await);
        assert_eq!(h.dapp.snapshot().await, ContractSnapshot::default());
        assert!(h.dapp.charities().await.is_empty());
        assert_eq!(h.chain.event_listener_count(), 0);
        assert_eq!(h.notifier.notices()[0].level, NoticeLevel::Warning);

        let err = h.dapp.donate(&charity(1).to_checksum(None), "1").await.unwrap_err();
        assert_eq!(err, DappError::NotConnectedOrWrongNetwork);
        assert_eq!(h.chain.write_calls(), 0);
    }

    #[tokio::test]
    async fn missing_wallet_is_reported() {
        let chain = chain_with_charities(1);
        let notifier = Arc::new(MemoryNotifier::default());
        let config = DappConfig {
            contract_address: Address::repeat_byte(0xcc),
            required_chain_id: CHAIN,
        };
        let dapp = DonationDapp::new(
            config,
            Capabilities::from_chain(chain).without_wallet(),
            notifier.clone(),
        );

        assert_eq!(dapp.connect().await, Err(DappError::NoWalletProvider));
        assert!(dapp.subscribe_notifications().is_none());
        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn donation_to_selected_charity_updates_state_and_log() -> anyhow::Result<()> {
        let h = harness(chain_with_charities(2));
        h.dapp.connect().await?;
        h.dapp.select_charity(&charity(2).to_checksum(None)).await?;

        let receipt = h.dapp.donate_to_selected("0.01").await?;

        let amount = U256::from(10_000_000_000_000_000u64);
        assert_eq!(h.dapp.snapshot().await.my_donated_wei, amount);
        assert_eq!(h.dapp.charities().await[1].allocated_wei, Some(amount + U256::from(200)));
        assert_eq!(h.dapp.selected_charity().await, Some(charity(2)));

        let dapp = h.dapp.clone();
        assert!(wait_until(move || {
            let dapp = dapp.clone();
            async move { !dapp.events().await.is_empty() }
        })
        .await);
        let events = h.dapp.events().await;
        assert_eq!(events[0].kind, EventKind::Donated);
        assert_eq!(events[0].tx_hash, receipt.tx_hash);
        assert_eq!(events[0].amount_wei, amount);
        Ok(())
    }

    #[tokio::test]
    async fn validation_errors_become_error_notices() -> anyhow::Result<()> {
        let chain = chain_with_charities(1);
        chain.set_min_donation(U256::from(1_000));
        let h = harness(chain);
        h.dapp.connect().await?;
        h.notifier.take();

        let err = h
            .dapp
            .donate(&charity(1).to_checksum(None), "0.0000000000000005")
            .await
            .unwrap_err();
        assert!(matches!(err, DappError::BelowMinimumDonation { .. }));

        let notices = h.notifier.take();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert_eq!(h.chain.write_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_transaction_is_reported_once() -> anyhow::Result<()> {
        let h = harness(chain_with_charities(1));
        h.dapp.connect().await?;
        h.notifier.take();
        h.chain.revert_next("paused");

        let err = h.dapp.donate(&charity(1).to_checksum(None), "1").await.unwrap_err();
        assert!(matches!(err, DappError::TransactionFailed(_)));
        let errors: Vec<_> = h
            .notifier
            .notices()
            .into_iter()
            .filter(|n| n.level == NoticeLevel::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key.as_deref(), Some("donate"));
        Ok(())
    }

    #[tokio::test]
    async fn provider_notification_tears_everything_down() -> anyhow::Result<()> {
        let h = harness(chain_with_charities(2));
        h.dapp.connect().await?;
        let watch = h.dapp.spawn_provider_watch().expect("wallet present");
        assert_eq!(h.chain.notification_listener_count(), 1);

        h.chain.switch_account(Address::repeat_byte(0xb2));
        let notifier = h.notifier.clone();
        assert!(wait_until(move || {
            let notifier = notifier.clone();
            async move {
                notifier
                    .notices()
                    .iter()
                    .any(|n| n.level == NoticeLevel::Warning)
            }
        })
        .await);

        assert!(!h.dapp.session().enabled().await);
        assert_eq!(h.chain.event_listener_count(), 0);
        assert_eq!(h.dapp.snapshot().await, ContractSnapshot::default());
        assert!(h.dapp.charities().await.is_empty());
        assert!(h.dapp.events().await.is_empty());
        assert_eq!(h.dapp.session().state().await.status, SessionStatus::Disconnected);

        let reconnected = h.dapp.connect().await?;
        assert_eq!(reconnected.account, Address::repeat_byte(0xb2));
        assert!(!h.dapp.is_owner().await);
        assert_eq!(h.dapp.charities().await.len(), 2);

        watch.abort();
        let _ = watch.await;
        assert_eq!(h.chain.notification_listener_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn account_switch_during_confirmation_keeps_state_cleared() -> anyhow::Result<()> {
        let h = harness(chain_with_charities(2));
        h.dapp.connect().await?;
        h.chain.hold_confirmations();

        let dapp = h.dapp.clone();
        let target = charity(1).to_checksum(None);
        let donation = tokio::spawn(async move { dapp.donate(&target, "1").await });
        let dapp = h.dapp.clone();
        assert!(wait_until(move || {
            let dapp = dapp.clone();
            async move { dapp.executor().in_flight(TxKind::Donate) }
        })
        .await);

        h.dapp
            .handle_notification(ProviderNotification::AccountsChanged(vec![Address::repeat_byte(0xb2)]))
            .await;
        h.chain.release_confirmations();
        donation.await??;

        assert!(!h.dapp.session().enabled().await);
        assert_eq!(h.dapp.snapshot().await, ContractSnapshot::default());
        assert!(h.dapp.charities().await.is_empty());
        assert_eq!(h.dapp.selected_charity().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn chain_switch_requires_reconnect_on_the_right_network() -> anyhow::Result<()> {
        let h = harness(chain_with_charities(1));
        h.dapp.connect().await?;

        h.dapp
            .handle_notification(ProviderNotification::ChainChanged(ChainId(5)))
            .await;
        h.chain.switch_chain(ChainId(5));

        let err = h.dapp.connect().await.unwrap_err();
        assert!(matches!(err, DappError::WrongNetwork { .. }));
        assert!(h.dapp.charities().await.is_empty());
        assert_eq!(h.chain.event_listener_count(), 0);
        Ok(())
    }
}
