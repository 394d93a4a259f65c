//! Idempotency engine: key generation plus a TTL'd response cache.
//!
//! The decorator sits between the user handler and the upstream
//! decorators. A cached success replays the stored outcome without
//! invoking the inner processor; a cached failure is rethrown, but only
//! failure kinds that are deterministic (validation, configuration,
//! missing handler) are ever cached — a timeout may succeed next time.
//!
//! Concurrency is best-effort: two concurrent misses on the same key may
//! both run the inner processor, and the store is last-writer-wins. There
//! is deliberately no per-key single-flight lock, so re-entrant calls
//! cannot deadlock.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use hm_core::{Clock, DynMessage, HeroError, ProcessingContext, Result};

use crate::{MessageProcessor, ProcessingOutcome};

/// Produces the cache key for a message. The default keys by message id.
pub trait KeyGenerator: Send + Sync {
    fn key_for(&self, message: &DynMessage) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageIdKeyGenerator;

impl KeyGenerator for MessageIdKeyGenerator {
    fn key_for(&self, message: &DynMessage) -> String {
        message.message_id().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    Success,
    Failure,
}

/// A cached failure, stored in a rebuildable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedFailure {
    Validation(String),
    Configuration(String),
    HandlerNotFound(String),
    SerializationVersion(String),
}

impl CachedFailure {
    /// Capture a failure if its kind is cacheable.
    fn capture(err: &HeroError) -> Option<Self> {
        match err {
            HeroError::Validation(m) => Some(CachedFailure::Validation(m.clone())),
            HeroError::Configuration(m) => Some(CachedFailure::Configuration(m.clone())),
            HeroError::HandlerNotFound(m) => Some(CachedFailure::HandlerNotFound(m.clone())),
            HeroError::SerializationVersion(m) => {
                Some(CachedFailure::SerializationVersion(m.clone()))
            }
            _ => None,
        }
    }

    fn rebuild(&self) -> HeroError {
        match self {
            CachedFailure::Validation(m) => HeroError::Validation(m.clone()),
            CachedFailure::Configuration(m) => HeroError::Configuration(m.clone()),
            CachedFailure::HandlerNotFound(m) => HeroError::HandlerNotFound(m.clone()),
            CachedFailure::SerializationVersion(m) => HeroError::SerializationVersion(m.clone()),
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub response: Option<Arc<dyn Any + Send + Sync>>,
    pub failure: Option<CachedFailure>,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IdempotencyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyRecord")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The idempotency cache. Lookups past `expires_at` are misses.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>>;

    async fn put(&self, record: IdempotencyRecord) -> Result<()>;

    /// Drop expired records; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>> {
        let cached = self.records.get(key).map(|record| record.clone());
        match cached {
            Some(record) if record.expires_at > now => Ok(Some(record)),
            Some(_) => {
                self.records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<()> {
        self.records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        Ok(before - self.records.len())
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    pub cache_failures: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            success_ttl: Duration::from_secs(24 * 60 * 60),
            failure_ttl: Duration::from_secs(60 * 60),
            cache_failures: true,
        }
    }
}

impl IdempotencyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.success_ttl.is_zero() || self.failure_ttl.is_zero() {
            return Err(HeroError::Configuration(
                "idempotency TTLs must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub struct IdempotencyProcessor<P> {
    inner: P,
    store: Arc<dyn IdempotencyStore>,
    keygen: Arc<dyn KeyGenerator>,
    config: IdempotencyConfig,
    clock: Arc<dyn Clock>,
}

impl<P> IdempotencyProcessor<P> {
    pub fn new(
        inner: P,
        store: Arc<dyn IdempotencyStore>,
        keygen: Arc<dyn KeyGenerator>,
        config: IdempotencyConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            store,
            keygen,
            config,
            clock,
        })
    }

    fn ttl(&self, status: IdempotencyStatus) -> chrono::Duration {
        let ttl = match status {
            IdempotencyStatus::Success => self.config.success_ttl,
            IdempotencyStatus::Failure => self.config.failure_ttl,
        };
        chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24))
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for IdempotencyProcessor<P> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        let key = self.keygen.key_for(message);
        let now = self.clock.now();

        if let Some(record) = self.store.get(&key, now).await? {
            match record.status {
                IdempotencyStatus::Success => {
                    debug!(key = %key, "Idempotent replay from cache");
                    metrics::counter!("heromessaging_pipeline_idempotent_replays_total")
                        .increment(1);
                    return Ok(ProcessingOutcome {
                        response: record.response,
                        replayed: true,
                    });
                }
                IdempotencyStatus::Failure if self.config.cache_failures => {
                    if let Some(failure) = &record.failure {
                        debug!(key = %key, "Idempotent failure replay from cache");
                        return Err(failure.rebuild());
                    }
                }
                IdempotencyStatus::Failure => {}
            }
        }

        match self.inner.process(message, ctx).await {
            Ok(outcome) => {
                let stored_at = self.clock.now();
                self.store
                    .put(IdempotencyRecord {
                        key,
                        status: IdempotencyStatus::Success,
                        response: outcome.response.clone(),
                        failure: None,
                        stored_at,
                        expires_at: stored_at + self.ttl(IdempotencyStatus::Success),
                    })
                    .await?;
                Ok(outcome)
            }
            Err(err) => {
                if self.config.cache_failures && err.is_idempotent_failure() {
                    if let Some(failure) = CachedFailure::capture(&err) {
                        let stored_at = self.clock.now();
                        self.store
                            .put(IdempotencyRecord {
                                key,
                                status: IdempotencyStatus::Failure,
                                response: None,
                                failure: Some(failure),
                                stored_at,
                                expires_at: stored_at + self.ttl(IdempotencyStatus::Failure),
                            })
                            .await?;
                    }
                }
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "idempotency"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use hm_core::{ManualClock, Message, MessageKind};

    struct Counting {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl MessageProcessor for Counting {
        async fn process(
            &self,
            _message: &DynMessage,
            _ctx: &ProcessingContext,
        ) -> Result<ProcessingOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HeroError::Validation("rejected".into()))
            } else {
                Ok(ProcessingOutcome::with_response(42u64))
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Ping;
    impl Message for Ping {}

    fn processor(
        fail: bool,
        clock: ManualClock,
    ) -> IdempotencyProcessor<Counting> {
        IdempotencyProcessor::new(
            Counting {
                calls: AtomicU32::new(0),
                fail,
            },
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(MessageIdKeyGenerator),
            IdempotencyConfig {
                success_ttl: Duration::from_secs(3600),
                failure_ttl: Duration::from_secs(60),
                cache_failures: true,
            },
            Arc::new(clock),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn repeated_submission_replays_cached_result() {
        let clock = ManualClock::starting_now();
        let idem = processor(false, clock);
        let ctx = ProcessingContext::new();
        let message = DynMessage::new(MessageKind::Command, Ping);

        let first = idem.process(&message, &ctx).await.unwrap();
        assert!(!first.replayed);

        let second = idem.process(&message, &ctx).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.response_as::<u64>().as_deref(), Some(&42));
        assert_eq!(idem.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_failure_rethrows_until_ttl_expires() {
        let clock = ManualClock::starting_now();
        let idem = processor(true, clock.clone());
        let ctx = ProcessingContext::new();
        let message = DynMessage::new(MessageKind::Command, Ping);

        assert!(matches!(
            idem.process(&message, &ctx).await,
            Err(HeroError::Validation(_))
        ));
        assert!(matches!(
            idem.process(&message, &ctx).await,
            Err(HeroError::Validation(_))
        ));
        assert_eq!(idem.inner.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        assert!(matches!(
            idem.process(&message, &ctx).await,
            Err(HeroError::Validation(_))
        ));
        assert_eq!(idem.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_not_cached() {
        let clock = ManualClock::starting_now();
        let idem = IdempotencyProcessor::new(
            TimeoutInner {
                calls: AtomicU32::new(0),
            },
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(MessageIdKeyGenerator),
            IdempotencyConfig::default(),
            Arc::new(clock),
        )
        .unwrap();
        let ctx = ProcessingContext::new();
        let message = DynMessage::new(MessageKind::Command, Ping);

        let _ = idem.process(&message, &ctx).await;
        let _ = idem.process(&message, &ctx).await;
        assert_eq!(idem.inner.calls.load(Ordering::SeqCst), 2);
    }

    struct TimeoutInner {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageProcessor for TimeoutInner {
        async fn process(
            &self,
            _message: &DynMessage,
            _ctx: &ProcessingContext,
        ) -> Result<ProcessingOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HeroError::Timeout(Duration::from_secs(1)))
        }

        fn name(&self) -> &'static str {
            "timeout"
        }
    }

    #[tokio::test]
    async fn zero_ttl_rejected_at_construction() {
        let result = IdempotencyProcessor::new(
            Counting {
                calls: AtomicU32::new(0),
                fail: false,
            },
            Arc::new(InMemoryIdempotencyStore::new()),
            Arc::new(MessageIdKeyGenerator),
            IdempotencyConfig {
                success_ttl: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(ManualClock::starting_now()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn expired_success_is_a_miss() {
        let clock = ManualClock::starting_now();
        let idem = processor(false, clock.clone());
        let ctx = ProcessingContext::new();
        let message = DynMessage::new(MessageKind::Command, Ping);

        idem.process(&message, &ctx).await.unwrap();
        clock.advance(Duration::from_secs(3601));
        let outcome = idem.process(&message, &ctx).await.unwrap();
        assert!(!outcome.replayed);
        assert_eq!(idem.inner.calls.load(Ordering::SeqCst), 2);
    }
}
