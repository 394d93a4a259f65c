//! Inbox engine: at-most-once handler execution.
//!
//! Before the handler runs, an inbox entry keyed by message id is
//! inserted; a duplicate insert within the dedup window discards the
//! message as already handled. The handler's effects and the
//! Received → Processed transition commit under the same unit of work
//! when a transaction factory is configured.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use hm_core::{Clock, DynMessage, HeroError, ProcessingContext, Result, SystemClock};
use hm_pipeline::{MessageDispatcher, ProcessingOutcome, TransactionFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxEntryState {
    Received,
    Processed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub message_id: Uuid,
    pub state: InboxEntryState,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Receiver-side dedup log. `add` is the exclusivity point: it returns
/// `None` for a message id already seen within the dedup window.
#[async_trait]
pub trait InboxStorage: Send + Sync {
    async fn add(&self, message: &DynMessage, now: DateTime<Utc>) -> Result<Option<InboxEntry>>;

    async fn is_duplicate(
        &self,
        message_id: Uuid,
        window: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get(&self, message_id: Uuid) -> Result<Option<InboxEntry>>;

    async fn mark_processed(&self, message_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> Result<()>;

    /// Drop entries received before `cutoff`; returns how many were
    /// removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

pub struct InMemoryInboxStorage {
    entries: DashMap<Uuid, InboxEntry>,
    /// Dedup window; entries older than this no longer count as
    /// duplicates. `None` means the window never closes.
    window: Option<Duration>,
}

impl InMemoryInboxStorage {
    pub fn new(window: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            window,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn within_window(&self, entry: &InboxEntry, now: DateTime<Utc>) -> bool {
        match self.window {
            None => true,
            Some(window) => {
                let age = now - entry.received_at;
                age <= chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::max_value())
            }
        }
    }
}

#[async_trait]
impl InboxStorage for InMemoryInboxStorage {
    async fn add(&self, message: &DynMessage, now: DateTime<Utc>) -> Result<Option<InboxEntry>> {
        let message_id = message.message_id();
        let fresh = InboxEntry {
            message_id,
            state: InboxEntryState::Received,
            received_at: now,
            processed_at: None,
            error: None,
        };
        let inserted = match self.entries.entry(message_id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                // An entry past the window is superseded, not a duplicate.
                if self.within_window(occupied.get(), now) {
                    None
                } else {
                    occupied.insert(fresh.clone());
                    Some(fresh)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(fresh.clone());
                Some(fresh)
            }
        };
        Ok(inserted)
    }

    async fn is_duplicate(
        &self,
        message_id: Uuid,
        window: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(entry) = self.entries.get(&message_id).map(|e| e.clone()) else {
            return Ok(false);
        };
        let window = window.or(self.window);
        Ok(match window {
            None => true,
            Some(window) => {
                (now - entry.received_at)
                    <= chrono::Duration::from_std(window)
                        .unwrap_or_else(|_| chrono::Duration::max_value())
            }
        })
    }

    async fn get(&self, message_id: Uuid) -> Result<Option<InboxEntry>> {
        Ok(self.entries.get(&message_id).map(|e| e.clone()))
    }

    async fn mark_processed(&self, message_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        match self.entries.get_mut(&message_id) {
            Some(mut entry) => {
                entry.state = InboxEntryState::Processed;
                entry.processed_at = Some(now);
                Ok(())
            }
            None => Err(HeroError::storage_permanent(format!(
                "inbox entry {message_id} not found"
            ))),
        }
    }

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> Result<()> {
        match self.entries.get_mut(&message_id) {
            Some(mut entry) => {
                entry.state = InboxEntryState::Failed;
                entry.error = Some(error.to_string());
                Ok(())
            }
            None => Err(HeroError::storage_permanent(format!(
                "inbox entry {message_id} not found"
            ))),
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.received_at >= cutoff);
        Ok(before - self.entries.len())
    }
}

/// Outcome of handing one transport delivery to the inbox.
#[derive(Debug)]
pub enum InboxOutcome {
    /// Handler ran; its outcome is attached.
    Handled(ProcessingOutcome),
    /// Message id already seen within the dedup window; handler skipped.
    Duplicate,
}

pub struct InboxProcessor {
    storage: Arc<dyn InboxStorage>,
    dispatcher: MessageDispatcher,
    transactions: Option<Arc<dyn TransactionFactory>>,
    clock: Arc<dyn Clock>,
}

impl InboxProcessor {
    pub fn new(storage: Arc<dyn InboxStorage>, dispatcher: MessageDispatcher) -> Self {
        Self {
            storage,
            dispatcher,
            transactions: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_transactions(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.transactions = Some(factory);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Process one inbound message with at-most-once handler semantics.
    pub async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<InboxOutcome> {
        ctx.ensure_active()?;
        let now = self.clock.now();

        if self.storage.add(message, now).await?.is_none() {
            debug!(
                message_id = %message.message_id(),
                "Duplicate delivery discarded by inbox"
            );
            metrics::counter!("heromessaging_inbox_duplicates_total").increment(1);
            return Ok(InboxOutcome::Duplicate);
        }

        let uow = match &self.transactions {
            Some(factory) => Some(factory.begin().await?),
            None => None,
        };

        match self.dispatcher.deliver(message, ctx).await {
            Ok(outcome) => {
                self.storage
                    .mark_processed(message.message_id(), self.clock.now())
                    .await?;
                if let Some(uow) = uow {
                    uow.commit().await?;
                }
                debug!(
                    event = "acknowledge",
                    message_id = %message.message_id(),
                    "Inbox delivery settled"
                );
                metrics::counter!("heromessaging_inbox_processed_total").increment(1);
                Ok(InboxOutcome::Handled(outcome))
            }
            Err(err) => {
                self.storage
                    .mark_failed(message.message_id(), &err.to_string())
                    .await?;
                if let Some(uow) = uow {
                    if let Err(rollback_err) = uow.rollback().await {
                        warn!(error = %rollback_err, "Inbox rollback failed");
                    }
                }
                metrics::counter!("heromessaging_inbox_failed_total").increment(1);
                Err(err)
            }
        }
    }
}
