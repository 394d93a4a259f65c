//! Message storage port with scoped transactions.
//!
//! Concrete backends (relational, document) live outside this workspace;
//! the in-memory implementation here backs tests and embedded hosts.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::envelope::DynMessage;
use crate::error::HeroError;
use crate::message::MessageKind;

/// Isolation profile a storage-backed implementation should run its
/// transactions under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

/// A unit of work. Implementations must release their resources on every
/// exit path; dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait StorageTransaction: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<(), HeroError>;

    async fn rollback(self: Box<Self>) -> Result<(), HeroError>;

    /// Downcast hook so a storage implementation can recognize its own
    /// transaction type when one is passed back in.
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub correlation_id: Option<String>,
    pub kind: Option<MessageKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait MessageStorage: Send + Sync {
    async fn store(
        &self,
        message: &DynMessage,
        tx: Option<&dyn StorageTransaction>,
    ) -> Result<(), HeroError>;

    async fn retrieve(
        &self,
        message_id: Uuid,
        tx: Option<&dyn StorageTransaction>,
    ) -> Result<Option<DynMessage>, HeroError>;

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<DynMessage>, HeroError>;

    async fn delete(&self, message_id: Uuid) -> Result<(), HeroError>;

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>, HeroError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

type SharedMessages = Arc<Mutex<HashMap<Uuid, DynMessage>>>;

enum StagedOp {
    Store(DynMessage),
}

/// Transaction over the in-memory store: writes are staged and applied
/// atomically on commit; rollback (or drop) discards them.
pub struct InMemoryTransaction {
    target: SharedMessages,
    staged: Mutex<Vec<StagedOp>>,
}

impl InMemoryTransaction {
    fn stage_store(&self, message: DynMessage) {
        self.staged.lock().push(StagedOp::Store(message));
    }
}

#[async_trait]
impl StorageTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), HeroError> {
        let ops = std::mem::take(&mut *self.staged.lock());
        let mut messages = self.target.lock();
        for op in ops {
            match op {
                StagedOp::Store(message) => {
                    messages.insert(message.message_id(), message);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), HeroError> {
        self.staged.lock().clear();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct InMemoryMessageStorage {
    messages: SharedMessages,
}

impl InMemoryMessageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl MessageStorage for InMemoryMessageStorage {
    async fn store(
        &self,
        message: &DynMessage,
        tx: Option<&dyn StorageTransaction>,
    ) -> Result<(), HeroError> {
        match tx {
            Some(tx) => {
                let tx = tx
                    .as_any()
                    .downcast_ref::<InMemoryTransaction>()
                    .ok_or_else(|| {
                        HeroError::storage_permanent("foreign transaction passed to memory store")
                    })?;
                tx.stage_store(message.clone());
            }
            None => {
                self.messages
                    .lock()
                    .insert(message.message_id(), message.clone());
            }
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        message_id: Uuid,
        _tx: Option<&dyn StorageTransaction>,
    ) -> Result<Option<DynMessage>, HeroError> {
        Ok(self.messages.lock().get(&message_id).cloned())
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<DynMessage>, HeroError> {
        let messages = self.messages.lock();
        let mut matched: Vec<DynMessage> = messages
            .values()
            .filter(|m| {
                filter
                    .correlation_id
                    .as_ref()
                    .map_or(true, |c| m.envelope.correlation_id.as_ref() == Some(c))
                    && filter.kind.map_or(true, |k| m.kind == k)
                    && filter.since.map_or(true, |t| m.envelope.timestamp >= t)
                    && filter.until.map_or(true, |t| m.envelope.timestamp <= t)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|m| m.envelope.timestamp);
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn delete(&self, message_id: Uuid) -> Result<(), HeroError> {
        self.messages.lock().remove(&message_id);
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>, HeroError> {
        Ok(Box::new(InMemoryTransaction {
            target: Arc::clone(&self.messages),
            staged: Mutex::new(Vec::new()),
        }))
    }
}
