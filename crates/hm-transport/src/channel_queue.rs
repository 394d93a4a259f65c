//! Channel-backed queue transport.
//!
//! Bounded MPMC on top of `tokio::sync::mpsc`: any number of producers,
//! consumers share the receiver behind an async mutex. When full the
//! producer either awaits capacity or drops the message and bumps a
//! counter, depending on `drop_when_full`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use hm_core::{DynMessage, HeroError, ProcessingContext, Result};

use crate::MessageTransport;

#[derive(Debug, Clone)]
pub struct ChannelQueueConfig {
    pub name: String,
    pub buffer_size: usize,
    pub drop_when_full: bool,
}

impl Default for ChannelQueueConfig {
    fn default() -> Self {
        Self {
            name: "channel".to_string(),
            buffer_size: 1024,
            drop_when_full: false,
        }
    }
}

pub struct ChannelQueue {
    config: ChannelQueueConfig,
    tx: mpsc::Sender<DynMessage>,
    rx: Mutex<mpsc::Receiver<DynMessage>>,
    depth: AtomicUsize,
    dropped: AtomicU64,
}

impl ChannelQueue {
    pub fn new(config: ChannelQueueConfig) -> Result<Self> {
        if config.buffer_size == 0 {
            return Err(HeroError::Configuration(
                "channel queue buffer_size must be positive".into(),
            ));
        }
        let (tx, rx) = mpsc::channel(config.buffer_size);
        Ok(Self {
            config,
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl MessageTransport for ChannelQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send(&self, message: DynMessage, ctx: &ProcessingContext) -> Result<()> {
        ctx.ensure_active()?;
        let started = Instant::now();

        if self.config.drop_when_full {
            match self.tx.try_send(message) {
                Ok(()) => {
                    self.depth.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(
                        "heromessaging_transport_operations_total",
                        "transport" => self.config.name.clone(),
                        "status" => "dropped"
                    )
                    .increment(1);
                    warn!(
                        event = "queue.full",
                        transport = %self.config.name,
                        message_id = %dropped.message_id(),
                        "Queue full, dropping message"
                    );
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(HeroError::QueueFull(self.config.name.clone()));
                }
            }
        } else {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => return Err(HeroError::Cancelled),
                sent = self.tx.send(message) => {
                    sent.map_err(|_| HeroError::QueueFull(self.config.name.clone()))?;
                    self.depth.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        metrics::counter!(
            "heromessaging_transport_operations_total",
            "transport" => self.config.name.clone(),
            "status" => "sent"
        )
        .increment(1);
        metrics::histogram!(
            "heromessaging_transport_send_duration_ms",
            "transport" => self.config.name.clone()
        )
        .record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    async fn receive(&self, ctx: &ProcessingContext) -> Result<DynMessage> {
        let started = Instant::now();
        let mut rx = tokio::select! {
            _ = ctx.cancellation().cancelled() => return Err(HeroError::Cancelled),
            guard = self.rx.lock() => guard,
        };
        let message = tokio::select! {
            _ = ctx.cancellation().cancelled() => return Err(HeroError::Cancelled),
            received = rx.recv() => {
                received.ok_or_else(|| HeroError::QueueFull(self.config.name.clone()))?
            }
        };
        self.depth.fetch_sub(1, Ordering::Relaxed);

        metrics::counter!(
            "heromessaging_transport_operations_total",
            "transport" => self.config.name.clone(),
            "status" => "received"
        )
        .increment(1);
        metrics::histogram!(
            "heromessaging_transport_receive_duration_ms",
            "transport" => self.config.name.clone()
        )
        .record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(transport = %self.config.name, message_id = %message.message_id(), "Message received");
        Ok(message)
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hm_core::{Message, MessageKind};

    struct Tick(u32);
    impl Message for Tick {}

    fn tick(n: u32) -> DynMessage {
        DynMessage::new(MessageKind::QueueMessage, Tick(n))
    }

    #[tokio::test]
    async fn send_receive_fifo_per_producer() {
        let queue = ChannelQueue::new(ChannelQueueConfig::default()).unwrap();
        let ctx = ProcessingContext::new();

        for n in 0..5 {
            queue.send(tick(n), &ctx).await.unwrap();
        }
        for n in 0..5 {
            let msg = queue.receive(&ctx).await.unwrap();
            assert_eq!(msg.payload_ref::<Tick>().map(|t| t.0), Some(n));
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn drop_when_full_counts_drops() {
        let queue = ChannelQueue::new(ChannelQueueConfig {
            name: "tiny".into(),
            buffer_size: 2,
            drop_when_full: true,
        })
        .unwrap();
        let ctx = ProcessingContext::new();

        for n in 0..5 {
            queue.send(tick(n), &ctx).await.unwrap();
        }
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn zero_buffer_size_is_rejected() {
        let result = ChannelQueue::new(ChannelQueueConfig {
            buffer_size: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(HeroError::Configuration(_))));
    }

    #[tokio::test]
    async fn cancelled_receive_returns_cancelled() {
        let queue = ChannelQueue::new(ChannelQueueConfig::default()).unwrap();
        let token = tokio_util::sync::CancellationToken::new();
        let ctx = ProcessingContext::new().with_cancellation(token.clone());

        token.cancel();
        assert!(matches!(
            queue.receive(&ctx).await,
            Err(HeroError::Cancelled)
        ));
    }
}
