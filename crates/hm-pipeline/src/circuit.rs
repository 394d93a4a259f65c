//! Circuit breaker decorator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use hm_core::{Clock, DynMessage, HeroError, ProcessingContext, Result};

use crate::{MessageProcessor, ProcessingOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

/// Closed/Open/HalfOpen breaker. All transitions happen under one mutex,
/// so the breaker is safe under parallel calls. Half-open admits a single
/// probe: success closes the breaker, any failure re-opens it.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.failure_threshold == 0 {
            return Err(HeroError::Configuration(
                "circuit breaker failure_threshold must be positive".into(),
            ));
        }
        Ok(Self {
            config,
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        })
    }

    /// Admit or reject the next call. Handles the Open → HalfOpen
    /// transition when the break has elapsed.
    pub fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| self.clock.now() - at)
                    .unwrap_or_else(chrono::Duration::zero);
                if elapsed
                    >= chrono::Duration::from_std(self.config.break_duration)
                        .unwrap_or_else(|_| chrono::Duration::zero())
                {
                    state.state = CircuitState::HalfOpen;
                    debug!("Circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(HeroError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
                info!("Circuit breaker closed after successful probe");
            }
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(self.clock.now());
                    warn!(
                        failures = state.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.opened_at = Some(self.clock.now());
                warn!("Circuit breaker re-opened on failed probe");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }
}

/// Decorator failing fast with `CircuitOpen` while the breaker is open.
/// Cancelled calls pass through without touching the failure count.
pub struct CircuitBreakerProcessor<P> {
    inner: P,
    breaker: Arc<CircuitBreaker>,
}

impl<P> CircuitBreakerProcessor<P> {
    pub fn new(inner: P, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl<P: MessageProcessor> MessageProcessor for CircuitBreakerProcessor<P> {
    async fn process(
        &self,
        message: &DynMessage,
        ctx: &ProcessingContext,
    ) -> Result<ProcessingOutcome> {
        self.breaker.try_acquire()?;
        match self.inner.process(message, ctx).await {
            Ok(outcome) => {
                self.breaker.record_success();
                Ok(outcome)
            }
            Err(HeroError::Cancelled) => Err(HeroError::Cancelled),
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "circuit-breaker"
    }
}
