//! Canonical decorator composition.

use std::sync::Arc;
use std::time::Duration;

use hm_core::{Clock, Result, SystemClock};

use crate::batching::{BatchingConfig, BatchingProcessor};
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerProcessor};
use crate::dispatcher::{DispatchProcessor, EventDispatchMode, MessageDispatcher};
use crate::idempotency::{
    IdempotencyConfig, IdempotencyProcessor, IdempotencyStore, InMemoryIdempotencyStore,
    KeyGenerator, MessageIdKeyGenerator,
};
use crate::observability::ObservabilityProcessor;
use crate::registry::HandlerRegistry;
use crate::retry::{RetryPolicy, RetryProcessor};
use crate::timeout::TimeoutProcessor;
use crate::transaction::{TransactionFactory, TransactionProcessor};
use crate::MessageProcessor;

/// Retry and circuit-breaker settings tuned for a deployment shape.
#[derive(Debug, Clone)]
pub struct ResilienceProfile {
    pub retry: RetryPolicy,
    pub circuit: CircuitBreakerConfig,
}

impl ResilienceProfile {
    pub fn cloud() -> Self {
        Self {
            retry: RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(120)),
            circuit: CircuitBreakerConfig {
                failure_threshold: 8,
                break_duration: Duration::from_secs(180),
            },
        }
    }

    pub fn on_premises() -> Self {
        Self {
            retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(30)),
            circuit: CircuitBreakerConfig {
                failure_threshold: 5,
                break_duration: Duration::from_secs(60),
            },
        }
    }

    pub fn microservices() -> Self {
        Self {
            retry: RetryPolicy::new(4, Duration::from_secs(1), Duration::from_secs(45)),
            circuit: CircuitBreakerConfig {
                failure_threshold: 6,
                break_duration: Duration::from_secs(90),
            },
        }
    }

    pub fn batch_processing() -> Self {
        Self {
            retry: RetryPolicy::new(7, Duration::from_secs(3), Duration::from_secs(300)),
            circuit: CircuitBreakerConfig {
                failure_threshold: 12,
                break_duration: Duration::from_secs(300),
            },
        }
    }

    /// Conservative settings for local development: fail fast, recover
    /// fast.
    pub fn development() -> Self {
        Self {
            retry: RetryPolicy::new(2, Duration::from_millis(250), Duration::from_secs(10)),
            circuit: CircuitBreakerConfig {
                failure_threshold: 3,
                break_duration: Duration::from_secs(30),
            },
        }
    }

    /// Aggressive retrying for deployments that prefer availability over
    /// latency.
    pub fn high_availability() -> Self {
        Self {
            retry: RetryPolicy::new(6, Duration::from_millis(500), Duration::from_secs(60)),
            circuit: CircuitBreakerConfig {
                failure_threshold: 10,
                break_duration: Duration::from_secs(30),
            },
        }
    }
}

/// Assembles the decorator chain in the canonical outside-in order:
/// `Observability → Retry → CircuitBreaker → Timeout → Transaction →
/// Idempotency → Batching → Terminal`. Disabled layers are skipped
/// without changing the relative order of the rest.
pub struct PipelineBuilder {
    clock: Arc<dyn Clock>,
    destination: String,
    observability: bool,
    resilience: Option<ResilienceProfile>,
    operation_timeout: Option<Duration>,
    transactions: Option<Arc<dyn TransactionFactory>>,
    idempotency: Option<IdempotencyLayer>,
    batching: Option<BatchingConfig>,
    event_mode: EventDispatchMode,
}

struct IdempotencyLayer {
    config: IdempotencyConfig,
    store: Arc<dyn IdempotencyStore>,
    keygen: Arc<dyn KeyGenerator>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            destination: "default".to_string(),
            observability: true,
            resilience: None,
            operation_timeout: None,
            transactions: None,
            idempotency: None,
            batching: None,
            event_mode: EventDispatchMode::Sequential,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    pub fn observability(mut self, enabled: bool) -> Self {
        self.observability = enabled;
        self
    }

    pub fn resilience(mut self, profile: ResilienceProfile) -> Self {
        self.resilience = Some(profile);
        self
    }

    /// Budget for one attempt of one message; exceeding it is a transient
    /// `Timeout` and retry-eligible.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn transactions(mut self, factory: Arc<dyn TransactionFactory>) -> Self {
        self.transactions = Some(factory);
        self
    }

    pub fn idempotency(mut self, config: IdempotencyConfig) -> Self {
        self.idempotency = Some(IdempotencyLayer {
            config,
            store: Arc::new(InMemoryIdempotencyStore::new()),
            keygen: Arc::new(MessageIdKeyGenerator),
        });
        self
    }

    pub fn idempotency_with(
        mut self,
        config: IdempotencyConfig,
        store: Arc<dyn IdempotencyStore>,
        keygen: Arc<dyn KeyGenerator>,
    ) -> Self {
        self.idempotency = Some(IdempotencyLayer {
            config,
            store,
            keygen,
        });
        self
    }

    pub fn batching(mut self, config: BatchingConfig) -> Self {
        self.batching = Some(config);
        self
    }

    pub fn event_dispatch(mut self, mode: EventDispatchMode) -> Self {
        self.event_mode = mode;
        self
    }

    /// Build a dispatcher over the decorated terminal for `registry`.
    pub fn build(self, registry: HandlerRegistry) -> Result<MessageDispatcher> {
        let event_mode = self.event_mode;
        let terminal = DispatchProcessor::new(Arc::new(registry), event_mode);
        let processor = self.build_around(Box::new(terminal))?;
        Ok(MessageDispatcher::with_processor(processor))
    }

    /// Wrap an arbitrary terminal processor (outbox and scheduler
    /// deliverers reuse the same chain).
    pub fn build_around(
        self,
        terminal: Box<dyn MessageProcessor>,
    ) -> Result<Arc<dyn MessageProcessor>> {
        let mut chain: Box<dyn MessageProcessor> = terminal;

        if let Some(config) = self.batching {
            chain = Box::new(BatchingProcessor::new(
                chain,
                config,
                Arc::clone(&self.clock),
            )?);
        }
        if let Some(layer) = self.idempotency {
            chain = Box::new(IdempotencyProcessor::new(
                chain,
                layer.store,
                layer.keygen,
                layer.config,
                Arc::clone(&self.clock),
            )?);
        }
        if let Some(factory) = self.transactions {
            chain = Box::new(TransactionProcessor::new(chain, factory));
        }
        if let Some(timeout) = self.operation_timeout {
            chain = Box::new(TimeoutProcessor::new(chain, timeout, Arc::clone(&self.clock))?);
        }
        if let Some(profile) = self.resilience {
            let breaker = Arc::new(CircuitBreaker::new(
                profile.circuit,
                Arc::clone(&self.clock),
            )?);
            chain = Box::new(CircuitBreakerProcessor::new(chain, breaker));
            chain = Box::new(RetryProcessor::new(
                chain,
                profile.retry,
                Arc::clone(&self.clock),
            ));
        }
        if self.observability {
            chain = Box::new(ObservabilityProcessor::new(chain, self.destination));
        }

        Ok(Arc::from(chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_match_documented_shapes() {
        let cloud = ResilienceProfile::cloud();
        assert_eq!(cloud.retry.max_retries, 5);
        assert_eq!(cloud.retry.base_delay, Duration::from_secs(2));
        assert_eq!(cloud.retry.max_delay, Duration::from_secs(120));
        assert_eq!(cloud.circuit.failure_threshold, 8);
        assert_eq!(cloud.circuit.break_duration, Duration::from_secs(180));

        let on_prem = ResilienceProfile::on_premises();
        assert_eq!(on_prem.retry.max_retries, 3);
        assert_eq!(on_prem.circuit.failure_threshold, 5);

        let batch = ResilienceProfile::batch_processing();
        assert_eq!(batch.retry.max_retries, 7);
        assert_eq!(batch.circuit.break_duration, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn full_chain_builds() {
        let dispatcher = PipelineBuilder::new()
            .resilience(ResilienceProfile::development())
            .operation_timeout(Duration::from_secs(30))
            .transactions(Arc::new(crate::transaction::NoopTransactionFactory::new()))
            .idempotency(IdempotencyConfig::default())
            .batching(BatchingConfig::default())
            .build(HandlerRegistry::new());
        assert!(dispatcher.is_ok());
    }
}
