//! Storage-backed scheduler poller.
//!
//! Every `polling_interval` the poller claims up to `batch_size` due
//! entries and hands them to the delivery handler, bounded by
//! `max_concurrency`. A cleanup task garbage-collects delivered rows and
//! returns stale `Delivering` claims (a crashed instance) to `Pending`.
//! Safe to run as multiple instances against one store.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hm_core::{HeroError, ProcessingContext, Result, SystemClock};

use crate::storage::ScheduledMessageStorage;
use crate::{next_recurrence, DeliveryHandler, DeliveryMode, ScheduledMessage, SharedClock};

#[derive(Debug, Clone)]
pub struct PollingSchedulerConfig {
    pub polling_interval: Duration,
    pub batch_size: usize,
    /// In-flight delivery cap per poll cycle.
    pub max_concurrency: usize,
    pub auto_cleanup: bool,
    /// Delivered rows older than this are garbage-collected.
    pub cleanup_age: Duration,
    pub cleanup_interval: Duration,
    /// `Delivering` claims older than this are returned to `Pending`.
    pub stale_timeout: Duration,
}

impl Default for PollingSchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_millis(500),
            batch_size: 100,
            max_concurrency: 16,
            auto_cleanup: true,
            cleanup_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(15 * 60),
            stale_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl PollingSchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_concurrency == 0 {
            return Err(HeroError::Configuration(
                "scheduler batch_size and max_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub struct PollingScheduler {
    config: PollingSchedulerConfig,
    storage: Arc<dyn ScheduledMessageStorage>,
    handler: Arc<dyn DeliveryHandler>,
    clock: SharedClock,
    shutdown: CancellationToken,
}

impl PollingScheduler {
    pub fn new(
        config: PollingSchedulerConfig,
        storage: Arc<dyn ScheduledMessageStorage>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            handler,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the poll loop (and the cleanup loop when enabled) until
    /// stopped; in-flight deliveries drain before returning.
    pub async fn run(self: Arc<Self>) {
        info!(
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "Starting polling scheduler"
        );

        let cleanup = if self.config.auto_cleanup {
            let scheduler = Arc::clone(&self);
            Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = scheduler.shutdown.cancelled() => break,
                        _ = scheduler.clock.sleep(scheduler.config.cleanup_interval) => {}
                    }
                    if let Err(e) = scheduler.cleanup_once().await {
                        error!(error = %e, "Scheduler cleanup failed");
                    }
                }
            }))
        } else {
            None
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.clock.sleep(self.config.polling_interval) => {}
            }
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Scheduler poll failed");
            }
        }

        if let Some(cleanup) = cleanup {
            let _ = cleanup.await;
        }
        info!("Polling scheduler stopped");
    }

    /// One poll cycle: claim due entries and deliver them concurrently.
    pub async fn poll_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.storage.claim_due(now, self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!(count = due.len(), "Claimed due scheduled messages");
        metrics::gauge!("heromessaging_scheduler_due_claimed").set(due.len() as f64);

        let delivered = stream::iter(due)
            .map(|scheduled| self.deliver_one(scheduled))
            .buffer_unordered(self.config.max_concurrency)
            .collect::<Vec<_>>()
            .await;

        Ok(delivered.into_iter().filter(|ok| *ok).count())
    }

    async fn deliver_one(&self, scheduled: ScheduledMessage) -> bool {
        let ctx = ProcessingContext::new().with_cancellation(self.shutdown.child_token());
        match self.handler.deliver(&scheduled.payload, &ctx).await {
            Ok(()) => {
                metrics::counter!("heromessaging_scheduler_dispatched_total").increment(1);
                let now = self.clock.now();
                let settle = match scheduled.delivery_mode {
                    DeliveryMode::OneShot => {
                        self.storage
                            .mark_delivered(scheduled.schedule_id, now)
                            .await
                    }
                    DeliveryMode::Recurring { interval } => {
                        let next = next_recurrence(scheduled.due_at, interval, now);
                        self.storage.reschedule(scheduled.schedule_id, next).await
                    }
                };
                if let Err(e) = settle {
                    error!(
                        schedule_id = %scheduled.schedule_id,
                        error = %e,
                        "Failed to settle delivered schedule"
                    );
                }
                true
            }
            Err(err) => {
                warn!(
                    schedule_id = %scheduled.schedule_id,
                    attempt = scheduled.attempt_count,
                    error = %err,
                    "Scheduled delivery failed"
                );
                metrics::counter!("heromessaging_scheduler_failed_total").increment(1);
                if let Err(e) = self
                    .storage
                    .mark_failed(scheduled.schedule_id, &err.to_string())
                    .await
                {
                    error!(
                        schedule_id = %scheduled.schedule_id,
                        error = %e,
                        "Failed to mark schedule failed"
                    );
                }
                false
            }
        }
    }

    /// Garbage-collect delivered rows and recover stale claims.
    pub async fn cleanup_once(&self) -> Result<(usize, usize)> {
        let now = self.clock.now();
        let cleanup_cutoff = now
            - chrono::Duration::from_std(self.config.cleanup_age)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let removed = self.storage.cleanup_delivered(cleanup_cutoff).await?;

        let stale_cutoff = now
            - chrono::Duration::from_std(self.config.stale_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let recovered = self.storage.recover_stale(stale_cutoff).await?;

        if removed > 0 || recovered > 0 {
            info!(removed, recovered, "Scheduler cleanup pass complete");
        }
        Ok((removed, recovered))
    }
}
