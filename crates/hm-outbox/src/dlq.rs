//! Dead-letter sink for entries that exhausted their retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hm_core::Result;

use crate::storage::OutboxEntry;

#[derive(Clone)]
pub struct DeadLetter {
    pub entry: OutboxEntry,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl std::fmt::Debug for DeadLetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetter")
            .field("entry_id", &self.entry.entry_id)
            .field("reason", &self.reason)
            .field("dead_lettered_at", &self.dead_lettered_at)
            .finish()
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry, reason: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryDeadLetterQueue {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }

    /// Take everything currently dead-lettered.
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.letters.lock())
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn publish(&self, entry: &OutboxEntry, reason: &str) -> Result<()> {
        self.letters.lock().push(DeadLetter {
            entry: entry.clone(),
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        metrics::counter!("heromessaging_outbox_dead_letters_total").increment(1);
        Ok(())
    }
}
