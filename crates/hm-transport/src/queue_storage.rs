//! Durable queue storage port.
//!
//! Dequeue hands out a lease; the consumer acks to remove the message or
//! rejects to requeue or discard it. Concrete backends live outside this
//! workspace; the in-memory implementation backs tests and embedded hosts.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use hm_core::{DynMessage, HeroError, Result};

/// A dequeued message plus the receipt used to settle it.
#[derive(Debug, Clone)]
pub struct QueueLease {
    pub message: DynMessage,
    pub receipt: String,
}

#[async_trait]
pub trait QueueStorage: Send + Sync {
    async fn enqueue(&self, queue: &str, message: DynMessage) -> Result<()>;

    /// Take the next message off the queue, leaving it in flight until
    /// acked or rejected.
    async fn dequeue(&self, queue: &str) -> Result<Option<QueueLease>>;

    /// Look at the head of the queue without taking it.
    async fn peek(&self, queue: &str) -> Result<Option<DynMessage>>;

    /// Settle a lease as processed.
    async fn ack(&self, queue: &str, receipt: &str) -> Result<()>;

    /// Settle a lease as failed; `requeue` returns it to the head.
    async fn reject(&self, queue: &str, receipt: &str, requeue: bool) -> Result<()>;

    /// Ready messages in the queue (in-flight excluded).
    async fn depth(&self, queue: &str) -> Result<usize>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<DynMessage>,
    in_flight: HashMap<String, DynMessage>,
}

#[derive(Default)]
pub struct InMemoryQueueStorage {
    queues: DashMap<String, Mutex<QueueState>>,
}

impl InMemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let state = self.queues.entry(queue.to_string()).or_default();
        let mut guard = state.lock();
        f(&mut guard)
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn enqueue(&self, queue: &str, message: DynMessage) -> Result<()> {
        self.with_queue(queue, |state| state.ready.push_back(message));
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<QueueLease>> {
        Ok(self.with_queue(queue, |state| {
            state.ready.pop_front().map(|message| {
                let receipt = Uuid::new_v4().to_string();
                state.in_flight.insert(receipt.clone(), message.clone());
                QueueLease { message, receipt }
            })
        }))
    }

    async fn peek(&self, queue: &str) -> Result<Option<DynMessage>> {
        Ok(self.with_queue(queue, |state| state.ready.front().cloned()))
    }

    async fn ack(&self, queue: &str, receipt: &str) -> Result<()> {
        let removed = self.with_queue(queue, |state| state.in_flight.remove(receipt));
        match removed {
            Some(_) => Ok(()),
            None => Err(HeroError::storage_permanent(format!(
                "unknown receipt '{receipt}' for queue '{queue}'"
            ))),
        }
    }

    async fn reject(&self, queue: &str, receipt: &str, requeue: bool) -> Result<()> {
        let removed = self.with_queue(queue, |state| {
            let message = state.in_flight.remove(receipt);
            if let (Some(message), true) = (&message, requeue) {
                state.ready.push_front(message.clone());
            }
            message
        });
        match removed {
            Some(_) => Ok(()),
            None => Err(HeroError::storage_permanent(format!(
                "unknown receipt '{receipt}' for queue '{queue}'"
            ))),
        }
    }

    async fn depth(&self, queue: &str) -> Result<usize> {
        Ok(self.with_queue(queue, |state| state.ready.len()))
    }
}
