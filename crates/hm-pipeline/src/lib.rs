//! Processor pipeline: dispatch, decorators, idempotency, resilience,
//! batching and transactions.
//!
//! Callers submit messages to a [`MessageDispatcher`]; a chain of
//! decorators wraps the terminal dispatch processor. Decorators are
//! transparent — same input, same outcome type, same error taxonomy plus
//! their own kind — and compose outside-in in a canonical order:
//!
//! `Observability → Resilience(retry + circuit) → Timeout → Transaction →
//! Idempotency → Batching → Terminal`
//!
//! The order is a contract: retries must wrap transactions so every retry
//! re-opens a fresh unit of work, and idempotency must wrap batching so
//! replays are deduplicated per message, not per batch.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use hm_core::{DynMessage, ProcessingContext, Result};

pub mod batching;
pub mod circuit;
pub mod dispatcher;
pub mod idempotency;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod timeout;
pub mod transaction;

pub use batching::{BatchingConfig, BatchingProcessor};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerProcessor, CircuitState};
pub use dispatcher::{
    DispatchProcessor, DispatcherHandle, EventDispatchMode, HandlerFailure, MessageDispatcher,
    PublishReport,
};
pub use idempotency::{
    IdempotencyConfig, IdempotencyProcessor, IdempotencyRecord, IdempotencyStatus,
    IdempotencyStore, InMemoryIdempotencyStore, KeyGenerator, MessageIdKeyGenerator,
};
pub use observability::ObservabilityProcessor;
pub use pipeline::{PipelineBuilder, ResilienceProfile};
pub use registry::{
    AnyEventSubscriber, CommandHandler, EventHandler, HandlerRegistry, QueryHandler,
};
pub use retry::{RetryPolicy, RetryProcessor};
pub use timeout::TimeoutProcessor;
pub use transaction::{
    NoopTransactionFactory, TransactionFactory, TransactionProcessor, UnitOfWork,
};

/// Result of processing one message.
#[derive(Clone, Default)]
pub struct ProcessingOutcome {
    /// Query response or publish report, type-erased.
    pub response: Option<Arc<dyn Any + Send + Sync>>,
    /// True when the outcome was served from the idempotency cache without
    /// invoking the inner processor.
    pub replayed: bool,
}

impl ProcessingOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_response<R: Any + Send + Sync>(response: R) -> Self {
        Self {
            response: Some(Arc::new(response)),
            replayed: false,
        }
    }

    pub fn response_as<R: Any + Send + Sync>(&self) -> Option<Arc<R>> {
        self.response
            .as_ref()
            .and_then(|r| Arc::clone(r).downcast::<R>().ok())
    }
}

impl std::fmt::Debug for ProcessingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingOutcome")
            .field("has_response", &self.response.is_some())
            .field("replayed", &self.replayed)
            .finish()
    }
}

/// One stage of the pipeline. Decorators wrap an inner processor and must
/// be reentrant: the pipeline is called from any number of producers at
/// once.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome>;

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<P: MessageProcessor + ?Sized> MessageProcessor for Arc<P> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        (**self).process(message, ctx).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

#[async_trait]
impl MessageProcessor for Box<dyn MessageProcessor> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        (**self).process(message, ctx).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
