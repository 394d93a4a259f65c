//! Per-operation timeout decorator.
//!
//! Races the inner processor against the injected clock; exceeding the
//! budget surfaces as `Timeout`, which the retry decorator classifies as
//! transient. Sits inside the resilience layer so a timed-out attempt is
//! retried with a fresh budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use hm_core::{Clock, DynMessage, HeroError, ProcessingContext, Result};

use crate::{MessageProcessor, ProcessingOutcome};

pub struct TimeoutProcessor<P> {
    inner: P,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<P> TimeoutProcessor<P> {
    pub fn new(inner: P, timeout: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if timeout.is_zero() {
            return Err(HeroError::Configuration(
                "operation timeout must be positive".into(),
            ));
        }
        Ok(Self {
            inner,
            timeout,
            clock,
        })
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for TimeoutProcessor<P> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        tokio::select! {
            result = self.inner.process(message, ctx) => result,
            _ = self.clock.sleep(self.timeout) => {
                warn!(
                    message_id = %message.message_id(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Operation timed out"
                );
                metrics::counter!("heromessaging_pipeline_timeouts_total").increment(1);
                Err(HeroError::Timeout(self.timeout))
            }
        }
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}
