//! In-process transports.
//!
//! Two interchangeable implementations sit behind [`MessageTransport`]:
//! a bounded channel queue for general use and a single-writer-principle
//! ring buffer for latency-critical paths. The crate also carries the
//! bit-stable [`TransportEnvelope`] wire format and the durable
//! [`QueueStorage`] port with its in-memory implementation.

use async_trait::async_trait;
use hm_core::{DynMessage, ProcessingContext, Result};

pub mod channel_queue;
pub mod envelope;
pub mod queue_storage;
pub mod ring_buffer;
pub mod wait;

pub use channel_queue::{ChannelQueue, ChannelQueueConfig};
pub use envelope::TransportEnvelope;
pub use queue_storage::{InMemoryQueueStorage, QueueLease, QueueStorage};
pub use ring_buffer::{
    ring_buffer, ProducerMode, RingBufferConfig, RingConsumer, RingProducer, RingTransport,
};
pub use wait::WaitStrategy;

/// An in-process transport: producers push messages, consumers pull them.
/// A message is delivered to exactly one receiver.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Transport name used in logs and metric labels.
    fn name(&self) -> &str;

    async fn send(&self, message: DynMessage, ctx: &ProcessingContext) -> Result<()>;

    /// Await the next message. Returns `Cancelled` when the context's token
    /// fires and `QueueFull`/`Timeout` never — receive only blocks.
    async fn receive(&self, ctx: &ProcessingContext) -> Result<DynMessage>;

    /// Messages currently buffered.
    fn depth(&self) -> usize;

    /// Messages dropped because the transport was full (drop mode only).
    fn dropped(&self) -> u64 {
        0
    }
}
