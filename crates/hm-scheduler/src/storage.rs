//! Scheduled-message storage port.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use hm_core::{HeroError, Result};

use crate::{ScheduleStatus, ScheduledMessage};

/// Persistence for scheduled messages. `claim_due` is the exclusivity
/// point: it atomically flips due `Pending` rows to `Delivering` so that
/// concurrent pollers never double-deliver.
#[async_trait]
pub trait ScheduledMessageStorage: Send + Sync {
    async fn add(&self, scheduled: ScheduledMessage) -> Result<()>;

    /// Claim up to `limit` entries with `due_at <= now` and status
    /// `Pending`, in due-time order.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>>;

    async fn mark_delivered(&self, schedule_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn mark_failed(&self, schedule_id: Uuid, error: &str) -> Result<()>;

    /// Return a claimed recurring entry to `Pending` at its next due time.
    async fn reschedule(&self, schedule_id: Uuid, next_due: DateTime<Utc>) -> Result<()>;

    /// Cancel a pending entry. Returns false when it was already claimed,
    /// delivered or unknown.
    async fn cancel(&self, schedule_id: Uuid) -> Result<bool>;

    async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduledMessage>>;

    /// Delete `Delivered` rows older than `older_than`; returns the count.
    async fn cleanup_delivered(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Return entries stuck `Delivering` since before `older_than` to
    /// `Pending`; returns the count.
    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

struct StoredSchedule {
    message: ScheduledMessage,
    claimed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryScheduledMessageStorage {
    entries: Mutex<HashMap<Uuid, StoredSchedule>>,
}

impl InMemoryScheduledMessageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_in_status(&self, status: ScheduleStatus) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|s| s.message.status == status)
            .count()
    }

    fn update<R>(
        &self,
        schedule_id: Uuid,
        f: impl FnOnce(&mut StoredSchedule) -> R,
    ) -> Result<R> {
        let mut entries = self.entries.lock();
        let stored = entries.get_mut(&schedule_id).ok_or_else(|| {
            HeroError::storage_permanent(format!("scheduled message {schedule_id} not found"))
        })?;
        Ok(f(stored))
    }
}

#[async_trait]
impl ScheduledMessageStorage for InMemoryScheduledMessageStorage {
    async fn add(&self, scheduled: ScheduledMessage) -> Result<()> {
        self.entries.lock().insert(
            scheduled.schedule_id,
            StoredSchedule {
                message: scheduled,
                claimed_at: None,
            },
        );
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledMessage>> {
        let mut entries = self.entries.lock();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = entries
            .values()
            .filter(|s| s.message.status == ScheduleStatus::Pending && s.message.due_at <= now)
            .map(|s| (s.message.due_at, s.message.schedule_id))
            .collect();
        due.sort_by_key(|(due_at, _)| *due_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(stored) = entries.get_mut(&id) {
                stored.message.status = ScheduleStatus::Delivering;
                stored.message.attempt_count += 1;
                stored.claimed_at = Some(now);
                claimed.push(stored.message.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, schedule_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.update(schedule_id, |stored| {
            stored.message.status = ScheduleStatus::Delivered;
            stored.message.delivered_at = Some(now);
            stored.claimed_at = None;
        })
    }

    async fn mark_failed(&self, schedule_id: Uuid, error: &str) -> Result<()> {
        self.update(schedule_id, |stored| {
            stored.message.status = ScheduleStatus::Failed;
            stored.message.last_error = Some(error.to_string());
            stored.claimed_at = None;
        })
    }

    async fn reschedule(&self, schedule_id: Uuid, next_due: DateTime<Utc>) -> Result<()> {
        self.update(schedule_id, |stored| {
            stored.message.status = ScheduleStatus::Pending;
            stored.message.due_at = next_due;
            stored.claimed_at = None;
        })
    }

    async fn cancel(&self, schedule_id: Uuid) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&schedule_id) {
            Some(stored) if stored.message.status == ScheduleStatus::Pending => {
                stored.message.status = ScheduleStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduledMessage>> {
        Ok(self
            .entries
            .lock()
            .get(&schedule_id)
            .map(|s| s.message.clone()))
    }

    async fn cleanup_delivered(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, stored| {
            !(stored.message.status == ScheduleStatus::Delivered
                && stored
                    .message
                    .delivered_at
                    .map_or(false, |at| at < older_than))
        });
        Ok(before - entries.len())
    }

    async fn recover_stale(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock();
        let mut recovered = 0usize;
        for stored in entries.values_mut() {
            if stored.message.status == ScheduleStatus::Delivering
                && stored.claimed_at.map_or(false, |at| at < older_than)
            {
                stored.message.status = ScheduleStatus::Pending;
                stored.claimed_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
