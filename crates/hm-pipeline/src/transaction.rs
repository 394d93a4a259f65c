//! Unit-of-work decorator.
//!
//! Opens one unit of work per message, commits on success and rolls back
//! on failure. The resilience layer wraps this decorator, so every retry
//! re-enters it and opens a fresh unit of work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use hm_core::{DynMessage, ProcessingContext, Result};

use crate::{MessageProcessor, ProcessingOutcome};

/// A scoped transactional boundary for a handler's business effects.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait TransactionFactory: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// Factory for hosts without a transactional store; commits and rollbacks
/// are counted no-ops.
#[derive(Default)]
pub struct NoopTransactionFactory {
    begun: AtomicU64,
    committed: Arc<AtomicU64>,
    rolled_back: Arc<AtomicU64>,
}

impl NoopTransactionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begun(&self) -> u64 {
        self.begun.load(Ordering::Relaxed)
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }
}

struct NoopUnitOfWork {
    committed: Arc<AtomicU64>,
    rolled_back: Arc<AtomicU64>,
}

#[async_trait]
impl UnitOfWork for NoopUnitOfWork {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl TransactionFactory for NoopTransactionFactory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(NoopUnitOfWork {
            committed: Arc::clone(&self.committed),
            rolled_back: Arc::clone(&self.rolled_back),
        }))
    }
}

pub struct TransactionProcessor<P> {
    inner: P,
    factory: Arc<dyn TransactionFactory>,
}

impl<P> TransactionProcessor<P> {
    pub fn new(inner: P, factory: Arc<dyn TransactionFactory>) -> Self {
        Self { inner, factory }
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for TransactionProcessor<P> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        let uow = self.factory.begin().await?;
        match self.inner.process(message, ctx).await {
            Ok(outcome) => {
                uow.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    // The original failure stays the surfaced error.
                    error!(
                        message_id = %message.message_id(),
                        error = %rollback_err,
                        "Rollback failed"
                    );
                } else {
                    warn!(
                        message_id = %message.message_id(),
                        error = %err,
                        "Unit of work rolled back"
                    );
                }
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "transaction"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::{HeroError, Message, MessageKind};

    struct Inner {
        fail: bool,
    }

    #[async_trait]
    impl MessageProcessor for Inner {
        async fn process(
            &self,
            _message: &DynMessage,
            _ctx: &ProcessingContext,
        ) -> Result<ProcessingOutcome> {
            if self.fail {
                Err(HeroError::Validation("no".into()))
            } else {
                Ok(ProcessingOutcome::done())
            }
        }

        fn name(&self) -> &'static str {
            "inner"
        }
    }

    struct Msg;
    impl Message for Msg {}

    #[tokio::test]
    async fn commits_on_success_rolls_back_on_failure() {
        let factory = Arc::new(NoopTransactionFactory::new());
        let ok = TransactionProcessor::new(Inner { fail: false }, factory.clone());
        let ctx = ProcessingContext::new();

        ok.process(&DynMessage::new(MessageKind::Command, Msg), &ctx)
            .await
            .unwrap();
        assert_eq!(factory.committed(), 1);
        assert_eq!(factory.rolled_back(), 0);

        let failing = TransactionProcessor::new(Inner { fail: true }, factory.clone());
        let result = failing
            .process(&DynMessage::new(MessageKind::Command, Msg), &ctx)
            .await;
        assert!(result.is_err());
        assert_eq!(factory.committed(), 1);
        assert_eq!(factory.rolled_back(), 1);
    }
}
