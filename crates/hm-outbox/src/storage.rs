//! Outbox entry model and storage port.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use hm_core::{DynMessage, HeroError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxEntryState {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxEntryState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxEntryState::Processed | OutboxEntryState::Failed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutboxOptions {
    /// Logical destination recorded for diagnostics and DLQ triage.
    pub destination: Option<String>,
    /// Per-entry override of the processor's retry budget.
    pub max_retries: Option<u32>,
}

#[derive(Clone)]
pub struct OutboxEntry {
    pub entry_id: Uuid,
    pub message: DynMessage,
    pub options: OutboxOptions,
    pub state: OutboxEntryState,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for OutboxEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxEntry")
            .field("entry_id", &self.entry_id)
            .field("message_id", &self.message.message_id())
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// Outbox persistence. `claim_pending` is the exclusivity point: the
/// Pending → Processing transition must be atomic so that concurrent
/// poller instances never claim the same entry twice.
#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Record an outbound message. Entries start `Pending`.
    async fn add(&self, message: DynMessage, options: OutboxOptions) -> Result<OutboxEntry>;

    /// Read pending entries without claiming them, oldest first.
    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Atomically claim up to `limit` due pending entries in `created_at`
    /// order, transitioning each to `Processing`.
    async fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>>;

    async fn mark_processed(&self, entry_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, entry_id: Uuid, error: &str) -> Result<()>;

    /// Return a claimed entry to `Pending` with an updated retry count and
    /// the time before which it must not be claimed again.
    async fn update_retry(
        &self,
        entry_id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<()>;

    async fn get_failed(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Reset entries stuck in `Processing` since before `older_than` back
    /// to `Pending`; returns how many were recovered.
    async fn reset_stuck(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

struct StoredEntry {
    entry: OutboxEntry,
    /// When the entry was last claimed, for stuck-entry recovery.
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryOutboxStorage {
    entries: Arc<Mutex<HashMap<Uuid, StoredEntry>>>,
}

impl InMemoryOutboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entry_id: Uuid) -> Option<OutboxEntry> {
        self.entries.lock().get(&entry_id).map(|s| s.entry.clone())
    }

    pub fn count_in_state(&self, state: OutboxEntryState) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|s| s.entry.state == state)
            .count()
    }

    fn update<R>(
        &self,
        entry_id: Uuid,
        f: impl FnOnce(&mut StoredEntry) -> R,
    ) -> Result<R> {
        let mut entries = self.entries.lock();
        let stored = entries.get_mut(&entry_id).ok_or_else(|| {
            HeroError::storage_permanent(format!("outbox entry {entry_id} not found"))
        })?;
        Ok(f(stored))
    }
}

#[async_trait]
impl OutboxStorage for InMemoryOutboxStorage {
    async fn add(&self, message: DynMessage, options: OutboxOptions) -> Result<OutboxEntry> {
        let entry = OutboxEntry {
            entry_id: Uuid::new_v4(),
            message,
            options,
            state: OutboxEntryState::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.entries.lock().insert(
            entry.entry_id,
            StoredEntry {
                entry: entry.clone(),
                claimed_at: None,
            },
        );
        Ok(entry)
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let entries = self.entries.lock();
        let mut pending: Vec<OutboxEntry> = entries
            .values()
            .filter(|s| s.entry.state == OutboxEntryState::Pending)
            .map(|s| s.entry.clone())
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        let mut entries = self.entries.lock();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = entries
            .values()
            .filter(|s| {
                s.entry.state == OutboxEntryState::Pending
                    && s.entry.next_retry_at.map_or(true, |at| at <= now)
            })
            .map(|s| (s.entry.created_at, s.entry.entry_id))
            .collect();
        due.sort_by_key(|(created_at, _)| *created_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(stored) = entries.get_mut(&id) {
                stored.entry.state = OutboxEntryState::Processing;
                stored.claimed_at = Some(now);
                claimed.push(stored.entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, entry_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.update(entry_id, |stored| {
            stored.entry.state = OutboxEntryState::Processed;
            stored.entry.processed_at = Some(now);
            stored.claimed_at = None;
        })
    }

    async fn mark_failed(&self, entry_id: Uuid, error: &str) -> Result<()> {
        self.update(entry_id, |stored| {
            stored.entry.state = OutboxEntryState::Failed;
            stored.entry.last_error = Some(error.to_string());
            stored.claimed_at = None;
        })
    }

    async fn update_retry(
        &self,
        entry_id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<()> {
        self.update(entry_id, |stored| {
            stored.entry.state = OutboxEntryState::Pending;
            stored.entry.retry_count = retry_count;
            stored.entry.next_retry_at = next_retry_at;
            stored.entry.last_error = Some(error.to_string());
            stored.claimed_at = None;
        })
    }

    async fn get_failed(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let entries = self.entries.lock();
        let mut failed: Vec<OutboxEntry> = entries
            .values()
            .filter(|s| s.entry.state == OutboxEntryState::Failed)
            .map(|s| s.entry.clone())
            .collect();
        failed.sort_by_key(|e| e.created_at);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn reset_stuck(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock();
        let mut recovered = 0u64;
        for stored in entries.values_mut() {
            if stored.entry.state == OutboxEntryState::Processing
                && stored.claimed_at.map_or(false, |at| at < older_than)
            {
                stored.entry.state = OutboxEntryState::Pending;
                stored.claimed_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::{Message, MessageKind};

    struct Note;
    impl Message for Note {}

    fn message() -> DynMessage {
        DynMessage::new(MessageKind::Command, Note)
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let storage = InMemoryOutboxStorage::new();
        storage.add(message(), OutboxOptions::default()).await.unwrap();
        storage.add(message(), OutboxOptions::default()).await.unwrap();

        let now = Utc::now();
        let first = storage.claim_pending(10, now).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = storage.claim_pending(10, now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_next_retry_at() {
        let storage = InMemoryOutboxStorage::new();
        let entry = storage.add(message(), OutboxOptions::default()).await.unwrap();

        let now = Utc::now();
        storage.claim_pending(10, now).await.unwrap();
        storage
            .update_retry(
                entry.entry_id,
                1,
                Some(now + chrono::Duration::seconds(60)),
                "transient",
            )
            .await
            .unwrap();

        assert!(storage.claim_pending(10, now).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(storage.claim_pending(10, later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stuck_processing_entries_recover() {
        let storage = InMemoryOutboxStorage::new();
        storage.add(message(), OutboxOptions::default()).await.unwrap();

        let claimed_at = Utc::now();
        storage.claim_pending(10, claimed_at).await.unwrap();

        let cutoff = claimed_at + chrono::Duration::seconds(301);
        let recovered = storage.reset_stuck(cutoff).await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(storage.count_in_state(OutboxEntryState::Pending), 1);
    }
}
