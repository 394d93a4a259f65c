//! Deferred and wall-clock message delivery.
//!
//! Two schedulers share one delivery contract: an in-memory min-heap
//! driven by a single timer, and a storage-backed poller that survives
//! process restarts. All due-time comparisons go through the injected
//! clock so tests drive virtual time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use hm_core::{DynMessage, ProcessingContext, Result};
use hm_pipeline::MessageDispatcher;

pub mod in_memory;
pub mod poller;
pub mod storage;

pub use in_memory::InMemoryScheduler;
pub use poller::{PollingScheduler, PollingSchedulerConfig};
pub use storage::{InMemoryScheduledMessageStorage, ScheduledMessageStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    OneShot,
    /// Redelivered every `interval` after each successful delivery.
    Recurring { interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Pending,
    Delivering,
    Delivered,
    Cancelled,
    Failed,
}

#[derive(Clone)]
pub struct ScheduledMessage {
    pub schedule_id: Uuid,
    pub due_at: DateTime<Utc>,
    pub payload: DynMessage,
    pub delivery_mode: DeliveryMode,
    pub status: ScheduleStatus,
    pub attempt_count: u32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ScheduledMessage {
    pub fn one_shot(payload: DynMessage, due_at: DateTime<Utc>) -> Self {
        Self::new(payload, due_at, DeliveryMode::OneShot)
    }

    pub fn recurring(payload: DynMessage, first_due: DateTime<Utc>, interval: Duration) -> Self {
        Self::new(payload, first_due, DeliveryMode::Recurring { interval })
    }

    fn new(payload: DynMessage, due_at: DateTime<Utc>, delivery_mode: DeliveryMode) -> Self {
        Self {
            schedule_id: Uuid::new_v4(),
            due_at,
            payload,
            delivery_mode,
            status: ScheduleStatus::Pending,
            attempt_count: 0,
            delivered_at: None,
            last_error: None,
        }
    }
}

impl std::fmt::Debug for ScheduledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledMessage")
            .field("schedule_id", &self.schedule_id)
            .field("due_at", &self.due_at)
            .field("delivery_mode", &self.delivery_mode)
            .field("status", &self.status)
            .field("attempt_count", &self.attempt_count)
            .finish()
    }
}

/// Where due messages go. Both schedulers deliver through this.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, message: &DynMessage, ctx: &ProcessingContext) -> Result<()>;
}

/// Delivers into the dispatcher pipeline.
pub struct DispatcherDelivery {
    dispatcher: MessageDispatcher,
}

impl DispatcherDelivery {
    pub fn new(dispatcher: MessageDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl DeliveryHandler for DispatcherDelivery {
    async fn deliver(&self, message: &DynMessage, ctx: &ProcessingContext) -> Result<()> {
        self.dispatcher.deliver(message, ctx).await.map(drop)
    }
}

/// Delivery callback backed by a closure, for hosts that bridge to a
/// transport instead of the dispatcher.
pub struct FnDelivery<F>(pub F);

#[async_trait]
impl<F, Fut> DeliveryHandler for FnDelivery<F>
where
    F: Fn(DynMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    async fn deliver(&self, message: &DynMessage, _ctx: &ProcessingContext) -> Result<()> {
        (self.0)(message.clone()).await
    }
}

pub(crate) fn next_recurrence(
    due_at: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let step = chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::seconds(60));
    let mut next = due_at + step;
    // Skip slots that are already in the past after a stall.
    while next <= now {
        next += step;
    }
    next
}

pub(crate) use hm_core::Clock;
pub(crate) type SharedClock = Arc<dyn Clock>;
