use crate::error::DappError;
use crate::session::Identity;
use dn_chain_client::{ContractEvent, ContractEvents, Subscription};
use dn_types::{EventKind, EventRecord};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const EVENT_LOG_CAPACITY: usize = 10;

/// Bounded, most-recent-first list of contract events.
#[derive(Debug, Default)]
pub struct EventLog {
    records: VecDeque<EventRecord>,
}

impl EventLog {
    /// Prepends `record` unless an event with the same kind and transaction
    /// hash is already present. Returns whether it was added.
    pub fn push(&mut self, record: EventRecord) -> bool {
        if self
            .records
            .iter()
            .any(|seen| seen.kind == record.kind && seen.tx_hash == record.tx_hash)
        {
            return false;
        }
        self.records.push_front(record);
        self.records.truncate(EVENT_LOG_CAPACITY);
        true
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn entries(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }
}

fn to_record(event: ContractEvent) -> EventRecord {
    match event {
        ContractEvent::Donated {
            donor,
            amount,
            tx_hash,
        } => EventRecord {
            kind: EventKind::Donated,
            actor: donor,
            amount_wei: amount,
            tx_hash,
        },
        ContractEvent::Withdrawn {
            recipient,
            amount,
            tx_hash,
        } => EventRecord {
            kind: EventKind::Withdrawn,
            actor: recipient,
            amount_wei: amount,
            tx_hash,
        },
    }
}

struct ActiveSubscription {
    identity: Identity,
    live: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

/// Owns the contract event subscriptions for the current identity.
///
/// Each activation gets its own liveness flag. The flag is checked under the
/// log lock before every append, so nothing from a torn-down activation can
/// land in the log.
pub struct EventSubscriptionManager {
    events: Arc<dyn ContractEvents>,
    log: Arc<Mutex<EventLog>>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl EventSubscriptionManager {
    pub fn new(events: Arc<dyn ContractEvents>) -> Self {
        Self {
            events,
            log: Arc::new(Mutex::new(EventLog::default())),
            active: Mutex::new(None),
        }
    }

    pub async fn activate(&self, identity: Identity) -> Result<(), DappError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|current| current.identity == identity) {
            return Ok(());
        }
        if let Some(previous) = active.take() {
            self.stop(previous).await;
        }

        let events = self
            .events
            .subscribe_events()
            .await
            .map_err(|err| DappError::ProviderFailed(format!("subscribe to contract events: {err}")))?;

        let live = Arc::new(AtomicBool::new(true));
        self.log.lock().await.clear();
        let pump = tokio::spawn(pump(events, self.log.clone(), live.clone()));

        info!(account = %identity.account, "contract event subscriptions active");
        *active = Some(ActiveSubscription {
            identity,
            live,
            pump,
        });
        Ok(())
    }

    /// Stops delivery and clears the log. Listeners are removed by the time
    /// this returns.
    pub async fn deactivate(&self) {
        let previous = self.active.lock().await.take();
        match previous {
            Some(previous) => self.stop(previous).await,
            None => self.log.lock().await.clear(),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn entries(&self) -> Vec<EventRecord> {
        self.log.lock().await.entries()
    }

    async fn stop(&self, subscription: ActiveSubscription) {
        {
            let mut log = self.log.lock().await;
            subscription.live.store(false, Ordering::Release);
            log.clear();
        }
        subscription.pump.abort();
        // the pump owns the subscription; it unsubscribes as the task is dropped
        let _ = subscription.pump.await;
        info!(account = %subscription.identity.account, "contract event subscriptions stopped");
    }
}

async fn pump(mut events: Subscription<ContractEvent>, log: Arc<Mutex<EventLog>>, live: Arc<AtomicBool>) {
    while let Some(event) = events.recv().await {
        let mut log = log.lock().await;
        if !live.load(Ordering::Acquire) {
            break;
        }
        let record = to_record(event);
        let kind = record.kind;
        if log.push(record) {
            debug!(%kind, entries = log.len(), "contract event recorded");
        }
    }
}
