//! Resilience and idempotency end-to-end scenarios.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hm_core::{
    DynMessage, HeroError, ManualClock, Message, MessageKind, ProcessingContext,
};
use hm_pipeline::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerProcessor, CircuitState,
    IdempotencyConfig, IdempotencyProcessor, InMemoryIdempotencyStore, MessageIdKeyGenerator,
    MessageProcessor, ProcessingOutcome,
};

struct Probe;
impl Message for Probe {}

fn probe() -> DynMessage {
    DynMessage::new(MessageKind::Command, Probe)
}

/// Inner processor whose behavior is scripted per call; runs beyond the
/// script succeed.
struct Scripted {
    calls: Arc<AtomicU32>,
    script: Vec<Result<(), HeroError>>,
}

impl Scripted {
    fn new(script: Vec<Result<(), HeroError>>) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
                script,
            },
            calls,
        )
    }
}

#[async_trait]
impl MessageProcessor for Scripted {
    async fn process(
        &self,
        _message: &DynMessage,
        _ctx: &ProcessingContext,
    ) -> hm_core::Result<ProcessingOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        match self.script.get(call) {
            Some(Ok(())) | None => Ok(ProcessingOutcome::done()),
            Some(Err(err)) => Err(clone_error(err)),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn clone_error(err: &HeroError) -> HeroError {
    match err {
        HeroError::Timeout(d) => HeroError::Timeout(*d),
        HeroError::Validation(m) => HeroError::Validation(m.clone()),
        other => HeroError::handler(anyhow::anyhow!("{other}")),
    }
}

/// Circuit opens after consecutive timeouts, rejects while open, then a
/// successful probe after the break closes it again.
#[tokio::test]
async fn circuit_opens_then_recovers() {
    let clock = ManualClock::starting_now();
    let (inner, calls) = Scripted::new(vec![
        Err(HeroError::Timeout(Duration::from_secs(1))),
        Err(HeroError::Timeout(Duration::from_secs(1))),
        Ok(()),
    ]);
    let breaker = Arc::new(
        CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                break_duration: Duration::from_secs(30),
            },
            Arc::new(clock.clone()),
        )
        .unwrap(),
    );
    let processor = CircuitBreakerProcessor::new(inner, Arc::clone(&breaker));
    let ctx = ProcessingContext::new();

    // Two consecutive timeouts trip the breaker.
    assert!(matches!(
        processor.process(&probe(), &ctx).await,
        Err(HeroError::Timeout(_))
    ));
    assert!(matches!(
        processor.process(&probe(), &ctx).await,
        Err(HeroError::Timeout(_))
    ));
    assert_eq!(breaker.state(), CircuitState::Open);

    // Within the break the call fails fast without reaching the inner.
    assert!(matches!(
        processor.process(&probe(), &ctx).await,
        Err(HeroError::CircuitOpen)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // After the break elapses the probe runs, succeeds, and resets the
    // breaker to closed.
    clock.advance(Duration::from_secs(31));
    processor.process(&probe(), &ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// First call stores the validation failure; a second call within the
/// failure TTL rethrows it without invoking the handler; after the TTL it
/// runs again.
#[tokio::test]
async fn idempotent_failure_cache_lifecycle() {
    let clock = ManualClock::starting_now();
    let (inner, calls) = Scripted::new(vec![
        Err(HeroError::Validation("argument out of range".into())),
        Err(HeroError::Validation("argument out of range".into())),
    ]);
    let idem = IdempotencyProcessor::new(
        inner,
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(MessageIdKeyGenerator),
        IdempotencyConfig {
            success_ttl: Duration::from_secs(24 * 3600),
            failure_ttl: Duration::from_secs(3600),
            cache_failures: true,
        },
        Arc::new(clock.clone()),
    )
    .unwrap();
    let ctx = ProcessingContext::new();
    let message = probe();

    // First call invokes the handler and caches the classified failure.
    assert!(matches!(
        idem.process(&message, &ctx).await,
        Err(HeroError::Validation(_))
    ));

    // Second call within the TTL rethrows from cache.
    assert!(matches!(
        idem.process(&message, &ctx).await,
        Err(HeroError::Validation(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Past the TTL the handler is invoked again.
    clock.advance(Duration::from_secs(3601));
    assert!(matches!(
        idem.process(&message, &ctx).await,
        Err(HeroError::Validation(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// All repeated submissions of the same message observe equal results and
/// the handler runs exactly once within the TTL.
#[tokio::test]
async fn repeated_submissions_observe_equal_results() {
    let clock = ManualClock::starting_now();
    let (inner, calls) = Scripted::new(vec![Ok(())]);
    let idem = Arc::new(
        IdempotencyProcessor::new(
            inner,
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(MessageIdKeyGenerator),
            IdempotencyConfig::default(),
            Arc::new(clock),
        )
        .unwrap(),
    );
    let message = probe();

    let mut replay_flags = Vec::new();
    for _ in 0..5 {
        let outcome = idem
            .process(&message, &ProcessingContext::new())
            .await
            .unwrap();
        replay_flags.push(outcome.replayed);
    }

    assert!(!replay_flags[0]);
    assert!(replay_flags[1..].iter().all(|&replayed| replayed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
