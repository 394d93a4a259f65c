//! Background outbox processor.
//!
//! Polls for due pending entries, claims a batch, delivers each through
//! the dispatcher pipeline and settles the entry: `Processed` on success,
//! back to `Pending` with backoff on transient failure, `Failed` plus a
//! dead letter once retries are exhausted. A recovery sweep returns
//! entries stuck in `Processing` (a crashed worker) to `Pending`.
//!
//! Several processor instances may poll one store; `claim_pending` is the
//! exclusivity point, and ordering is per-worker FIFO only.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hm_core::{Clock, HeroError, ProcessingContext, Result, SystemClock};
use hm_pipeline::{MessageDispatcher, RetryPolicy};

use crate::dlq::DeadLetterSink;
use crate::storage::OutboxStorage;

#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Backoff shape for `next_retry_at`, shared with the pipeline's
    /// retry decorator.
    pub retry: RetryPolicy,
    /// How long an entry may sit in `Processing` before the recovery
    /// sweep returns it to `Pending`.
    pub stuck_timeout: Duration,
    pub recovery_interval: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_retries: 3,
            retry: RetryPolicy::default(),
            stuck_timeout: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollStats {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

pub struct OutboxProcessor {
    config: OutboxProcessorConfig,
    storage: Arc<dyn OutboxStorage>,
    dispatcher: MessageDispatcher,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl OutboxProcessor {
    pub fn new(
        config: OutboxProcessorConfig,
        storage: Arc<dyn OutboxStorage>,
        dispatcher: MessageDispatcher,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            config,
            storage,
            dispatcher,
            dead_letters,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run the polling and recovery loops until stopped. In-flight work
    /// finishes before this returns.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Starting outbox processor"
        );

        let recovery = {
            let processor = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = processor.shutdown.cancelled() => break,
                        _ = processor.clock.sleep(processor.config.recovery_interval) => {}
                    }
                    if let Err(e) = processor.recover_stuck().await {
                        error!(error = %e, "Outbox recovery sweep failed");
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.clock.sleep(self.config.poll_interval) => {}
            }
            match self.poll_once().await {
                Ok(stats) if stats.claimed > 0 => {
                    debug!(
                        claimed = stats.claimed,
                        processed = stats.processed,
                        retried = stats.retried,
                        dead_lettered = stats.dead_lettered,
                        "Outbox poll complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Outbox poll failed"),
            }
        }

        let _ = recovery.await;
        info!("Outbox processor stopped");
    }

    /// One poll cycle: claim a batch and settle every claimed entry.
    pub async fn poll_once(&self) -> Result<PollStats> {
        let now = self.clock.now();
        let claimed = self
            .storage
            .claim_pending(self.config.batch_size, now)
            .await?;
        let mut stats = PollStats {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(stats);
        }

        metrics::gauge!("heromessaging_outbox_claimed").set(claimed.len() as f64);

        let mut batch = claimed.into_iter();
        while let Some(entry) = batch.next() {
            let ctx = ProcessingContext::new().with_cancellation(self.shutdown.child_token());
            match self.dispatcher.deliver(&entry.message, &ctx).await {
                Ok(_) => {
                    self.storage
                        .mark_processed(entry.entry_id, self.clock.now())
                        .await?;
                    debug!(
                        event = "acknowledge",
                        entry_id = %entry.entry_id,
                        message_id = %entry.message.message_id(),
                        "Outbox entry settled"
                    );
                    stats.processed += 1;
                    metrics::counter!("heromessaging_outbox_processed_total").increment(1);
                }
                Err(HeroError::Cancelled) => {
                    // Shutting down mid-batch: hand the claimed remainder
                    // back so another worker picks it up without waiting
                    // for the recovery sweep.
                    self.storage
                        .update_retry(
                            entry.entry_id,
                            entry.retry_count,
                            None,
                            "delivery cancelled",
                        )
                        .await?;
                    for entry in batch {
                        self.storage
                            .update_retry(
                                entry.entry_id,
                                entry.retry_count,
                                None,
                                "delivery cancelled",
                            )
                            .await?;
                    }
                    return Ok(stats);
                }
                Err(err) => {
                    let max_retries = entry.options.max_retries.unwrap_or(self.config.max_retries);
                    let attempts = entry.retry_count + 1;
                    if err.is_transient() && attempts <= max_retries {
                        let delay = self.config.retry.delay_for(attempts);
                        let next_retry_at = self.clock.now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(30));
                        warn!(
                            entry_id = %entry.entry_id,
                            attempts,
                            next_retry_at = %next_retry_at,
                            error = %err,
                            "Outbox delivery failed, scheduling retry"
                        );
                        self.storage
                            .update_retry(
                                entry.entry_id,
                                attempts,
                                Some(next_retry_at),
                                &err.to_string(),
                            )
                            .await?;
                        stats.retried += 1;
                        metrics::counter!("heromessaging_outbox_retries_total").increment(1);
                    } else {
                        let reason = if err.is_transient() {
                            format!("retries exhausted after {} attempts: {err}", attempts)
                        } else {
                            format!("permanent failure: {err}")
                        };
                        warn!(
                            entry_id = %entry.entry_id,
                            reason = %reason,
                            "Outbox entry dead-lettered"
                        );
                        self.storage.mark_failed(entry.entry_id, &reason).await?;
                        self.dead_letters.publish(&entry, &reason).await?;
                        stats.dead_lettered += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    async fn recover_stuck(&self) -> Result<u64> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.stuck_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let recovered = self.storage.reset_stuck(cutoff).await?;
        if recovered > 0 {
            info!(recovered, "Recovered stuck outbox entries");
            metrics::counter!("heromessaging_outbox_recovered_total").increment(recovered);
        }
        Ok(recovered)
    }
}
