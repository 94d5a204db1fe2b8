use crate::error::DappError;
use crate::selection::SelectionReconciler;
use crate::session::Identity;
use alloy_primitives::Address;
use dn_chain_client::{ChainError, ContractReader};
use dn_types::{CharityEntity, ContractSnapshot};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Registry sizes above this are treated as a bad read.
pub const MAX_CHARITIES: u64 = 256;
const CHARITY_READ_CONCURRENCY: usize = 16;

#[derive(Debug, Default)]
struct CharityState {
    entities: Vec<CharityEntity>,
    selection: SelectionReconciler,
}

/// Holds the last consistent view of the donation contract.
///
/// Refresh results are buffered and written in one step; a failed refresh
/// leaves the previous view in place. `reset` bumps an epoch so that a refresh
/// started for an earlier identity never publishes its result.
pub struct ContractStateAggregator {
    reader: Arc<dyn ContractReader>,
    snapshot: RwLock<ContractSnapshot>,
    charities: RwLock<CharityState>,
    epoch: AtomicU64,
}

impl ContractStateAggregator {
    pub fn new(reader: Arc<dyn ContractReader>) -> Self {
        Self {
            reader,
            snapshot: RwLock::new(ContractSnapshot::default()),
            charities: RwLock::new(CharityState::default()),
            epoch: AtomicU64::new(0),
        }
    }

    pub async fn snapshot(&self) -> ContractSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn charities(&self) -> Vec<CharityEntity> {
        self.charities.read().await.entities.clone()
    }

    pub async fn selected_charity(&self) -> Option<Address> {
        self.charities.read().await.selection.selected()
    }

    pub async fn select_charity(&self, address: Address) -> Result<(), DappError> {
        let mut guard = self.charities.write().await;
        let state = &mut *guard;
        if state.selection.select(address, &state.entities) {
            Ok(())
        } else {
            Err(DappError::InvalidAddress(format!(
                "{} is not a registered charity",
                address.to_checksum(None)
            )))
        }
    }

    pub async fn is_owner(&self, account: Address) -> bool {
        let owner = self.snapshot.read().await.owner;
        !owner.is_zero() && owner == account
    }

    /// Identity epoch; bumped by every [`Self::reset`].
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub async fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *self.snapshot.write().await = ContractSnapshot::default();
        let mut charities = self.charities.write().await;
        charities.entities.clear();
        charities.selection.clear();
    }

    /// Reads the five contract-level scalars concurrently and replaces the
    /// snapshot only if every read succeeded.
    pub async fn refresh_core(&self, identity: &Identity) -> Result<ContractSnapshot, DappError> {
        self.refresh_core_at(identity, self.epoch()).await
    }

    async fn refresh_core_at(&self, identity: &Identity, epoch: u64) -> Result<ContractSnapshot, DappError> {
        self.ensure_epoch(epoch)?;
        let reader = &self.reader;

        let (owner, min_donation_wei, total_donated_wei, my_donated_wei, contract_balance_wei) =
            tokio::try_join!(
                reader.owner(),
                reader.min_donation_wei(),
                reader.total_donated(),
                reader.donated_by(identity.account),
                reader.contract_balance(),
            )
            .map_err(refresh_failed("core state"))?;

        let snapshot = ContractSnapshot {
            owner,
            min_donation_wei,
            total_donated_wei,
            contract_balance_wei,
            my_donated_wei,
        };

        let mut current = self.snapshot.write().await;
        self.ensure_epoch(epoch)?;
        *current = snapshot.clone();
        debug!(account = %identity.account, "contract snapshot refreshed");
        Ok(snapshot)
    }

    /// Reloads the charity registry. Name and balance reads degrade per
    /// charity; count and address reads fail the whole refresh.
    pub async fn refresh_charities(&self, identity: &Identity) -> Result<Vec<CharityEntity>, DappError> {
        self.refresh_charities_at(identity, self.epoch()).await
    }

    async fn refresh_charities_at(
        &self,
        identity: &Identity,
        epoch: u64,
    ) -> Result<Vec<CharityEntity>, DappError> {
        self.ensure_epoch(epoch)?;

        let count = self
            .reader
            .charities_count()
            .await
            .map_err(refresh_failed("charity count"))?;
        if count > MAX_CHARITIES {
            warn!(count, max = MAX_CHARITIES, "implausible charity count");
            return Err(DappError::RefreshFailed(format!(
                "charity count {count} exceeds {MAX_CHARITIES}"
            )));
        }

        let permits = Arc::new(Semaphore::new(CHARITY_READ_CONCURRENCY));
        let mut lookups = JoinSet::new();
        for index in 0..count {
            let reader = self.reader.clone();
            let permits = permits.clone();
            lookups.spawn(async move {
                let _permit = permits.acquire().await;
                (index, reader.charity_at(index).await)
            });
        }

        let mut addresses = Vec::with_capacity(lookups.len());
        while let Some(joined) = lookups.join_next().await {
            let (index, address) = joined.map_err(|err| DappError::RefreshFailed(err.to_string()))?;
            addresses.push((index, address.map_err(refresh_failed("charity address"))?));
        }
        addresses.sort_by_key(|(index, _)| *index);

        let mut details = JoinSet::new();
        for (index, address) in addresses {
            let reader = self.reader.clone();
            let permits = permits.clone();
            details.spawn(async move {
                let _permit = permits.acquire().await;
                let (name, balance) =
                    tokio::join!(reader.charity_name(address), reader.charity_balance_wei(address));
                if let Err(err) = &name {
                    warn!(%address, "charity name unavailable: {err}");
                }
                if let Err(err) = &balance {
                    warn!(%address, "charity balance unavailable: {err}");
                }
                (index, CharityEntity::from_reads(address, name.ok(), balance.ok()))
            });
        }

        let mut entities = Vec::with_capacity(details.len());
        while let Some(joined) = details.join_next().await {
            entities.push(joined.map_err(|err| DappError::RefreshFailed(err.to_string()))?);
        }
        entities.sort_by_key(|(index, _)| *index);
        let entities: Vec<CharityEntity> = entities.into_iter().map(|(_, entity)| entity).collect();

        let mut guard = self.charities.write().await;
        self.ensure_epoch(epoch)?;
        let state = &mut *guard;
        state.entities = entities.clone();
        let selected = state.selection.reconcile(&state.entities);
        info!(
            account = %identity.account,
            charities = entities.len(),
            selected = ?selected,
            "charity registry refreshed"
        );
        Ok(entities)
    }

    /// Runs both refreshes concurrently. Whichever succeeds is kept even if
    /// the other fails.
    pub async fn refresh_all(&self, identity: &Identity) -> Result<(), DappError> {
        self.refresh_all_at(identity, self.epoch()).await
    }

    /// Like [`Self::refresh_all`], but publishes nothing unless the epoch is
    /// still `epoch`. Used by callers that captured the epoch before a long
    /// wait.
    pub async fn refresh_all_at(&self, identity: &Identity, epoch: u64) -> Result<(), DappError> {
        let (core, charities) = tokio::join!(
            self.refresh_core_at(identity, epoch),
            self.refresh_charities_at(identity, epoch)
        );
        match (core, charities) {
            (Ok(_), Ok(_)) => Ok(()),
            (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
            (Err(core), Err(charities)) => Err(DappError::RefreshFailed(format!(
                "{}; {}",
                failure_cause(core),
                failure_cause(charities)
            ))),
        }
    }

    fn ensure_epoch(&self, started: u64) -> Result<(), DappError> {
        if self.epoch.load(Ordering::Acquire) == started {
            Ok(())
        } else {
            Err(DappError::RefreshFailed(
                "wallet identity changed during refresh".to_owned(),
            ))
        }
    }
}

fn refresh_failed(what: &'static str) -> impl Fn(ChainError) -> DappError {
    move |err| {
        warn!("{what} refresh failed: {err}");
        DappError::RefreshFailed(format!("{what}: {err}"))
    }
}

fn failure_cause(err: DappError) -> String {
    match err {
        DappError::RefreshFailed(cause) => cause,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{account, chain_with_charities, charity, identity};
    use alloy_primitives::U256;

    fn aggregator(chain: &dn_chain_memory::InMemoryChain) -> ContractStateAggregator {
        ContractStateAggregator::new(Arc::new(chain.clone()))
    }

    #[tokio::test]
    async fn core_refresh_replaces_snapshot() {
        let chain = chain_with_charities(2);
        chain.set_min_donation(U256::from(1_000));
        chain.set_contract_balance(U256::from(42));
        let aggregator = aggregator(&chain);
        assert_eq!(aggregator.snapshot().await, ContractSnapshot::default());

        let snapshot = aggregator.refresh_core(&identity()).await.unwrap();
        assert_eq!(snapshot.owner, account());
        assert_eq!(snapshot.min_donation_wei, U256::from(1_000));
        assert_eq!(snapshot.contract_balance_wei, U256::from(42));
        assert_eq!(aggregator.snapshot().await, snapshot);
        assert!(aggregator.is_owner(account()).await);
        assert!(!aggregator.is_owner(charity(1)).await);
    }

    #[tokio::test]
    async fn failed_core_refresh_keeps_previous_snapshot() {
        let chain = chain_with_charities(1);
        chain.set_min_donation(U256::from(7));
        let aggregator = aggregator(&chain);
        let before = aggregator.refresh_core(&identity()).await.unwrap();

        chain.set_min_donation(U256::from(99));
        chain.set_core_reads_failing(true);
        let err = aggregator.refresh_core(&identity()).await.unwrap_err();
        assert!(matches!(err, DappError::RefreshFailed(_)));
        assert_eq!(aggregator.snapshot().await, before);
    }

    #[tokio::test]
    async fn charities_keep_on_chain_order_and_degrade_per_entity() {
        let chain = chain_with_charities(3);
        chain.fail_name_read(charity(2));
        chain.fail_balance_read(charity(3));
        let aggregator = aggregator(&chain);

        let entities = aggregator.refresh_charities(&identity()).await.unwrap();
        let addresses: Vec<_> = entities.iter().map(|e| e.address).collect();
        assert_eq!(addresses, vec![charity(1), charity(2), charity(3)]);

        assert_eq!(entities[0].name, "Charity 1");
        assert_eq!(entities[1].name, dn_types::short_address(&charity(2)));
        assert_eq!(entities[1].allocated_wei, Some(U256::from(200)));
        assert_eq!(entities[2].name, "Charity 3");
        assert_eq!(entities[2].allocated_wei, None);

        assert_eq!(aggregator.selected_charity().await, Some(charity(1)));
    }

    #[tokio::test]
    async fn implausible_charity_count_is_rejected() {
        let chain = chain_with_charities(2);
        let aggregator = aggregator(&chain);
        aggregator.refresh_charities(&identity()).await.unwrap();

        chain.report_charity_count(Some(u64::MAX));
        let err = aggregator.refresh_charities(&identity()).await.unwrap_err();
        assert!(matches!(err, DappError::RefreshFailed(cause) if cause.contains("exceeds")));
        assert_eq!(aggregator.charities().await.len(), 2);

        chain.report_charity_count(Some(MAX_CHARITIES));
        let err = aggregator.refresh_charities(&identity()).await.unwrap_err();
        assert!(matches!(err, DappError::RefreshFailed(cause) if cause.contains("out of range")));
    }

    #[tokio::test]
    async fn shrinking_set_reselects_first_entity() {
        let chain = chain_with_charities(3);
        let aggregator = aggregator(&chain);
        aggregator.refresh_charities(&identity()).await.unwrap();
        aggregator.select_charity(charity(3)).await.unwrap();

        chain.remove_charity(charity(3));
        aggregator.refresh_charities(&identity()).await.unwrap();

        assert_eq!(aggregator.charities().await.len(), 2);
        assert_eq!(aggregator.selected_charity().await, Some(charity(1)));
    }

    #[tokio::test]
    async fn emptied_registry_clears_selection() {
        let chain = chain_with_charities(1);
        let aggregator = aggregator(&chain);
        aggregator.refresh_charities(&identity()).await.unwrap();

        chain.remove_charity(charity(1));
        aggregator.refresh_charities(&identity()).await.unwrap();
        assert_eq!(aggregator.selected_charity().await, None);
    }

    #[tokio::test]
    async fn selecting_unknown_charity_is_rejected() {
        let chain = chain_with_charities(2);
        let aggregator = aggregator(&chain);
        aggregator.refresh_charities(&identity()).await.unwrap();

        let err = aggregator.select_charity(charity(9)).await.unwrap_err();
        assert!(matches!(err, DappError::InvalidAddress(_)));
        assert_eq!(aggregator.selected_charity().await, Some(charity(1)));
    }

    #[tokio::test]
    async fn refresh_all_keeps_successful_half() {
        let chain = chain_with_charities(2);
        chain.set_core_reads_failing(true);
        let aggregator = aggregator(&chain);

        let err = aggregator.refresh_all(&identity()).await.unwrap_err();
        assert!(matches!(err, DappError::RefreshFailed(_)));
        assert_eq!(aggregator.snapshot().await, ContractSnapshot::default());
        assert_eq!(aggregator.charities().await.len(), 2);
    }

    #[tokio::test]
    async fn refresh_pinned_to_an_old_epoch_publishes_nothing() {
        let chain = chain_with_charities(2);
        let aggregator = aggregator(&chain);
        let pinned = aggregator.epoch();

        aggregator.reset().await;
        assert_ne!(aggregator.epoch(), pinned);

        let err = aggregator.refresh_all_at(&identity(), pinned).await.unwrap_err();
        assert!(matches!(err, DappError::RefreshFailed(_)));
        assert_eq!(aggregator.snapshot().await, ContractSnapshot::default());
        assert!(aggregator.charities().await.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let chain = chain_with_charities(2);
        let aggregator = aggregator(&chain);
        aggregator.refresh_all(&identity()).await.unwrap();

        aggregator.reset().await;
        assert_eq!(aggregator.snapshot().await, ContractSnapshot::default());
        assert!(aggregator.charities().await.is_empty());
        assert_eq!(aggregator.selected_charity().await, None);
    }
}
