//! Timeout sweeper: stale sagas get a synthetic timeout event.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hm_core::{
    Clock, DynMessage, Envelope, Event, Message, MessageKind, ProcessingContext, Result,
    SystemClock,
};

use crate::orchestrator::SagaOrchestrator;
use crate::repository::SagaRepository;

/// Synthetic event dispatched to sagas that have gone quiet. Definitions
/// handle it like any other event, typically transitioning to a
/// `TimedOut` terminal state.
#[derive(Debug, Clone)]
pub struct SagaTimeout {
    pub correlation_id: String,
    pub idle_for: Duration,
}

impl Message for SagaTimeout {
    fn message_type() -> &'static str {
        "SagaTimeout"
    }
}
impl Event for SagaTimeout {}

#[derive(Debug, Clone)]
pub struct TimeoutSweeperConfig {
    pub check_interval: Duration,
    /// A not-completed saga untouched for longer than this times out.
    pub default_timeout: Duration,
}

impl Default for TimeoutSweeperConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            default_timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct TimeoutSweeper<S: Send + Sync + 'static> {
    config: TimeoutSweeperConfig,
    orchestrator: Arc<SagaOrchestrator<S>>,
    repository: Arc<dyn SagaRepository<S>>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl<S: Default + Clone + Send + Sync + 'static> TimeoutSweeper<S> {
    pub fn new(
        config: TimeoutSweeperConfig,
        orchestrator: Arc<SagaOrchestrator<S>>,
        repository: Arc<dyn SagaRepository<S>>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            repository,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            check_interval_s = self.config.check_interval.as_secs(),
            default_timeout_s = self.config.default_timeout.as_secs(),
            "Starting saga timeout sweeper"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.clock.sleep(self.config.check_interval) => {}
            }
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Timeout sweep failed");
            }
        }
        info!("Saga timeout sweeper stopped");
    }

    /// One sweep: every stale instance gets a `SagaTimeout` dispatched
    /// through the orchestrator.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(self.config.default_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let stale = self.repository.find_stale(cutoff).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        debug!(count = stale.len(), "Sweeping stale sagas");
        let mut timed_out = 0usize;
        for saga in stale {
            let idle_for = (now - saga.updated_at)
                .to_std()
                .unwrap_or(self.config.default_timeout);
            let envelope = Envelope::new().with_correlation(saga.correlation_id.clone());
            let event = DynMessage::with_envelope(
                envelope,
                MessageKind::Event,
                SagaTimeout {
                    correlation_id: saga.correlation_id.clone(),
                    idle_for,
                },
            );
            let ctx = ProcessingContext::new().with_cancellation(self.shutdown.child_token());
            match self.orchestrator.handle(&event, &ctx).await {
                Ok(progress) => {
                    debug!(
                        correlation_id = %saga.correlation_id,
                        ?progress,
                        "Timeout event dispatched"
                    );
                    timed_out += 1;
                }
                Err(err) => {
                    warn!(
                        correlation_id = %saga.correlation_id,
                        error = %err,
                        "Timeout dispatch failed"
                    );
                }
            }
        }
        metrics::counter!("heromessaging_saga_timeouts_total").increment(timed_out as u64);
        Ok(timed_out)
    }
}
