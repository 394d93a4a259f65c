//! In-memory scheduler: a min-heap keyed by due time driven by one timer
//! task.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use hm_core::{DynMessage, ProcessingContext};

use crate::{next_recurrence, DeliveryHandler, DeliveryMode, SharedClock};

struct HeapItem {
    due_at: DateTime<Utc>,
    /// Tie-breaker preserving insertion order for equal due times.
    seq: u64,
    schedule_id: Uuid,
    payload: DynMessage,
    mode: DeliveryMode,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then(self.seq.cmp(&other.seq))
    }
}

struct SchedulerState {
    heap: BinaryHeap<Reverse<HeapItem>>,
    cancelled: HashSet<Uuid>,
    next_seq: u64,
}

/// Peek-and-sleep scheduler. All due items dispatch on each wake, in due
/// order; a newly scheduled earlier item interrupts the current sleep.
pub struct InMemoryScheduler {
    state: Mutex<SchedulerState>,
    handler: Arc<dyn DeliveryHandler>,
    clock: SharedClock,
    wake: Notify,
    shutdown: CancellationToken,
}

impl InMemoryScheduler {
    pub fn new(handler: Arc<dyn DeliveryHandler>, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                next_seq: 0,
            }),
            handler,
            clock,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn schedule(&self, payload: DynMessage, due_at: DateTime<Utc>) -> Uuid {
        self.push(payload, due_at, DeliveryMode::OneShot)
    }

    pub fn schedule_in(&self, payload: DynMessage, delay: Duration) -> Uuid {
        let due_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.schedule(payload, due_at)
    }

    pub fn schedule_recurring(
        &self,
        payload: DynMessage,
        first_due: DateTime<Utc>,
        interval: Duration,
    ) -> Uuid {
        self.push(payload, first_due, DeliveryMode::Recurring { interval })
    }

    fn push(&self, payload: DynMessage, due_at: DateTime<Utc>, mode: DeliveryMode) -> Uuid {
        let schedule_id = Uuid::new_v4();
        {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(HeapItem {
                due_at,
                seq,
                schedule_id,
                payload,
                mode,
            }));
        }
        // The timer may be sleeping toward a later deadline.
        self.wake.notify_one();
        schedule_id
    }

    /// Cancel a scheduled delivery. Effective until the moment the item is
    /// popped for dispatch.
    pub fn cancel(&self, schedule_id: Uuid) -> bool {
        self.state.lock().cancelled.insert(schedule_id)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.wake.notify_one();
    }

    /// Run the timer loop until stopped.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let next_due = self.state.lock().heap.peek().map(|Reverse(item)| item.due_at);
            match next_due {
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
                Some(due_at) => {
                    let now = self.clock.now();
                    if due_at <= now {
                        self.dispatch_due(now).await;
                    } else {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = self.wake.notified() => {}
                            _ = self.clock.sleep_until(due_at) => {}
                        }
                    }
                }
            }
        }
        debug!("In-memory scheduler stopped");
    }

    /// Pop and deliver everything due at `now`.
    async fn dispatch_due(&self, now: DateTime<Utc>) {
        loop {
            let item = {
                let mut state = self.state.lock();
                let due = matches!(state.heap.peek(), Some(Reverse(item)) if item.due_at <= now);
                if !due {
                    break;
                }
                let Some(Reverse(item)) = state.heap.pop() else {
                    break;
                };
                if state.cancelled.remove(&item.schedule_id) {
                    continue;
                }
                item
            };

            let ctx = ProcessingContext::new().with_cancellation(self.shutdown.child_token());
            metrics::counter!("heromessaging_scheduler_dispatched_total").increment(1);
            if let Err(err) = self.handler.deliver(&item.payload, &ctx).await {
                warn!(
                    schedule_id = %item.schedule_id,
                    error = %err,
                    "Scheduled delivery failed"
                );
                metrics::counter!("heromessaging_scheduler_failed_total").increment(1);
            } else if let DeliveryMode::Recurring { interval } = item.mode {
                let next = next_recurrence(item.due_at, interval, now);
                let mut state = self.state.lock();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.heap.push(Reverse(HeapItem {
                    due_at: next,
                    seq,
                    schedule_id: item.schedule_id,
                    payload: item.payload,
                    mode: item.mode,
                }));
            }
        }
    }
}
