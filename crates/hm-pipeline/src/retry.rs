//! Retry with exponential backoff and jitter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use hm_core::{Clock, DynMessage, HeroError, ProcessingContext, Result};

use crate::{MessageProcessor, ProcessingOutcome};

/// Backoff policy: attempt `n` (1-based, attempt 1 is the original call)
/// sleeps `min(max_delay, base * 2^(n-1)) * jitter` with jitter drawn from
/// `[0.8, 1.2)` before the next attempt.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra transient classification on top of the built-in closed set.
    classifier: Option<Arc<dyn Fn(&HeroError) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("has_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            classifier: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            classifier: None,
        }
    }

    pub fn with_classifier(
        mut self,
        is_transient: impl Fn(&HeroError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Arc::new(is_transient));
        self
    }

    /// Whether `err` is worth another attempt. Cancellation and the other
    /// fatal kinds bypass retry entirely, including the custom hook.
    pub fn is_transient(&self, err: &HeroError) -> bool {
        if err.is_fatal() {
            return false;
        }
        if err.is_transient() {
            return true;
        }
        self.classifier.as_ref().map_or(false, |hook| hook(err))
    }

    /// Backoff before attempt `attempt + 1`, jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        exponential.mul_f64(jitter)
    }
}

/// Decorator retrying transient failures of the inner processor. Sleeps go
/// through the injected clock and honor cancellation immediately.
pub struct RetryProcessor<P> {
    inner: P,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<P> RetryProcessor<P> {
    pub fn new(inner: P, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            policy,
            clock,
        }
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for RetryProcessor<P> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        let mut attempt = 1u32;
        loop {
            ctx.ensure_active()?;
            match self.inner.process(message, ctx).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if attempt >= self.policy.max_retries || !self.policy.is_transient(&err) {
                        if attempt > 1 {
                            warn!(
                                message_id = %message.message_id(),
                                attempts = attempt,
                                error = %err,
                                "Giving up after retries"
                            );
                        }
                        return Err(err);
                    }
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        message_id = %message.message_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    metrics::counter!("heromessaging_pipeline_retries_total").increment(1);
                    tokio::select! {
                        _ = ctx.cancellation().cancelled() => return Err(HeroError::Cancelled),
                        _ = self.clock.sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use hm_core::{ManualClock, Message, MessageKind, SystemClock};

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> HeroError,
    }

    #[async_trait]
    impl MessageProcessor for Flaky {
        async fn process(
            &self,
            _message: &DynMessage,
            _ctx: &ProcessingContext,
        ) -> Result<ProcessingOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err((self.error)())
            } else {
                Ok(ProcessingOutcome::done())
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    struct Probe;
    impl Message for Probe {}

    fn probe() -> DynMessage {
        DynMessage::new(MessageKind::Command, Probe)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(120));
        // Jitter is [0.8, 1.2), so bound-check rather than compare exactly.
        let d1 = policy.delay_for(1);
        assert!(d1 >= Duration::from_millis(1600) && d1 < Duration::from_millis(2400));
        let d3 = policy.delay_for(3);
        assert!(d3 >= Duration::from_millis(6400) && d3 < Duration::from_millis(9600));
        let capped = policy.delay_for(10);
        assert!(capped <= Duration::from_secs(144));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let inner = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
            error: || HeroError::Timeout(Duration::from_millis(10)),
        };
        let retry = RetryProcessor::new(
            inner,
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            Arc::new(SystemClock),
        );

        retry.process(&probe(), &ProcessingContext::new()).await.unwrap();
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_failures_bypass_retry() {
        let inner = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 5,
            error: || HeroError::Validation("bad input".into()),
        };
        let retry = RetryProcessor::new(
            inner,
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            Arc::new(SystemClock),
        );

        let err = retry.process(&probe(), &ProcessingContext::new()).await;
        assert!(matches!(err, Err(HeroError::Validation(_))));
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff_sleep() {
        let inner = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 10,
            error: || HeroError::Timeout(Duration::from_millis(10)),
        };
        let clock = ManualClock::starting_now();
        let retry = Arc::new(RetryProcessor::new(
            inner,
            RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60)),
            Arc::new(clock),
        ));

        let token = tokio_util::sync::CancellationToken::new();
        let ctx = ProcessingContext::new().with_cancellation(token.clone());

        let task = {
            let retry = Arc::clone(&retry);
            tokio::spawn(async move { retry.process(&probe(), &ctx).await })
        };
        tokio::task::yield_now().await;
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(HeroError::Cancelled)));
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_classifier_extends_transient_set() {
        let inner = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
            error: || HeroError::handler(anyhow::anyhow!("shard rebalancing")),
        };
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5))
            .with_classifier(|err| err.to_string().contains("rebalancing"));
        let retry = RetryProcessor::new(inner, policy, Arc::new(SystemClock));

        retry.process(&probe(), &ProcessingContext::new()).await.unwrap();
        assert_eq!(retry.inner.calls.load(Ordering::SeqCst), 2);
    }
}
