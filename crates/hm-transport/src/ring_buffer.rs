//! Single-writer-principle ring buffer.
//!
//! A power-of-two slot array indexed by `sequence & (capacity - 1)`. The
//! producer cursor and every consumer cursor sit on their own cache line.
//! Each slot carries a published-sequence marker written *after* the slot
//! value, so a consumer that observes `slot.sequence == wanted` is
//! guaranteed a fully written payload.
//!
//! Consumers are independent: each has its own cursor and observes every
//! published item, so a `Clone`-able payload fans out without copying the
//! buffer. Producers stall (or fail in try mode) once they would lap the
//! slowest consumer.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::warn;

use hm_core::{DynMessage, HeroError, ProcessingContext, Result};

use crate::wait::WaitStrategy;
use crate::MessageTransport;

/// Sequence marker for a slot that has never been published.
const SEQ_EMPTY: u64 = u64::MAX;
/// Spin rounds before a strategy falls back to yielding/parking.
const SPIN_ROUNDS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// One producer thread; claims are a plain atomic increment.
    Single,
    /// Any number of producers; claims CAS the next sequence.
    Multi,
}

#[derive(Debug, Clone)]
pub struct RingBufferConfig {
    /// Slot count; must be a power of two.
    pub capacity: usize,
    pub producer_mode: ProducerMode,
    pub wait_strategy: WaitStrategy,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::default(),
        }
    }
}

struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<Option<T>>,
}

// Safety: slot values are only written by the producer that claimed the
// sequence, before the sequence marker is released; consumers only read a
// slot whose marker equals their cursor, and producers never reclaim a
// slot until every consumer cursor has moved past it.
unsafe impl<T: Send> Sync for Slot<T> {}

struct RingShared<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    capacity: u64,
    mode: ProducerMode,
    wait: WaitStrategy,
    next_seq: CachePadded<AtomicU64>,
    consumers: RwLock<Vec<Arc<CachePadded<AtomicU64>>>>,
    signal_lock: Mutex<()>,
    signal: Condvar,
    closed: AtomicBool,
}

impl<T> RingShared<T> {
    /// Smallest consumer cursor, or the producer cursor when nobody is
    /// subscribed (items are then overwritten freely).
    fn min_cursor(&self) -> u64 {
        let consumers = self.consumers.read();
        consumers
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .min()
            .unwrap_or_else(|| self.next_seq.load(Ordering::Acquire))
    }

    fn notify(&self) {
        if self.wait.needs_signal() {
            let _guard = self.signal_lock.lock();
            self.signal.notify_all();
        }
    }

    /// One round of waiting per the configured strategy. Returns false when
    /// a bounded strategy ran out of time.
    fn wait_round(&self, spins: &mut u32, started: Instant) -> bool {
        match self.wait {
            WaitStrategy::BusySpin => {
                std::hint::spin_loop();
                true
            }
            WaitStrategy::Yielding => {
                if *spins < SPIN_ROUNDS {
                    *spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
                true
            }
            WaitStrategy::Sleeping { idle } => {
                if *spins < SPIN_ROUNDS {
                    *spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::sleep(idle);
                }
                true
            }
            WaitStrategy::Blocking => {
                let mut guard = self.signal_lock.lock();
                let _ = self
                    .signal
                    .wait_for(&mut guard, std::time::Duration::from_millis(10));
                true
            }
            WaitStrategy::TimeoutBlocking { timeout } => {
                if started.elapsed() >= timeout {
                    return false;
                }
                let mut guard = self.signal_lock.lock();
                let _ = self
                    .signal
                    .wait_for(&mut guard, std::time::Duration::from_millis(1));
                started.elapsed() < timeout
            }
        }
    }
}

/// Validate the configuration and build a connected producer/consumer pair.
pub fn ring_buffer<T: Send + 'static>(
    config: RingBufferConfig,
) -> Result<(RingProducer<T>, RingConsumer<T>)> {
    if config.capacity == 0 || !config.capacity.is_power_of_two() {
        return Err(HeroError::Configuration(format!(
            "ring buffer capacity must be a power of two, got {}",
            config.capacity
        )));
    }

    let slots = (0..config.capacity)
        .map(|_| Slot {
            sequence: AtomicU64::new(SEQ_EMPTY),
            value: UnsafeCell::new(None),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(RingShared {
        slots,
        mask: config.capacity as u64 - 1,
        capacity: config.capacity as u64,
        mode: config.producer_mode,
        wait: config.wait_strategy,
        next_seq: CachePadded::new(AtomicU64::new(0)),
        consumers: RwLock::new(Vec::new()),
        signal_lock: Mutex::new(()),
        signal: Condvar::new(),
        closed: AtomicBool::new(false),
    });

    let producer = RingProducer {
        shared: Arc::clone(&shared),
    };
    let consumer = producer.add_consumer();
    Ok((producer, consumer))
}

pub struct RingProducer<T> {
    shared: Arc<RingShared<T>>,
}

impl<T> Clone for RingProducer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> RingProducer<T> {
    /// Register a new consumer starting at the current head.
    pub fn add_consumer(&self) -> RingConsumer<T> {
        let cursor = Arc::new(CachePadded::new(AtomicU64::new(
            self.shared.next_seq.load(Ordering::Acquire),
        )));
        self.shared.consumers.write().push(Arc::clone(&cursor));
        RingConsumer {
            shared: Arc::clone(&self.shared),
            cursor,
        }
    }

    /// Claim the next sequence if the ring has room.
    fn try_claim(&self) -> Option<u64> {
        match self.shared.mode {
            ProducerMode::Single => {
                let claimed = self.shared.next_seq.load(Ordering::Relaxed);
                if claimed >= self.shared.min_cursor() + self.shared.capacity {
                    return None;
                }
                self.shared.next_seq.store(claimed + 1, Ordering::Release);
                Some(claimed)
            }
            ProducerMode::Multi => loop {
                let claimed = self.shared.next_seq.load(Ordering::Acquire);
                if claimed >= self.shared.min_cursor() + self.shared.capacity {
                    return None;
                }
                if self
                    .shared
                    .next_seq
                    .compare_exchange_weak(
                        claimed,
                        claimed + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Some(claimed);
                }
            },
        }
    }

    fn write(&self, seq: u64, value: T) {
        let slot = &self.shared.slots[(seq & self.shared.mask) as usize];
        // Safety: the claim protocol gives this producer exclusive access
        // to the slot until the marker below is published.
        unsafe {
            *slot.value.get() = Some(value);
        }
        slot.sequence.store(seq, Ordering::Release);
        self.shared.notify();
    }

    /// Publish without blocking. Returns the claimed sequence, or the value
    /// back when the ring is full.
    pub fn try_publish(&self, value: T) -> std::result::Result<u64, T> {
        match self.try_claim() {
            Some(seq) => {
                self.write(seq, value);
                Ok(seq)
            }
            None => Err(value),
        }
    }

    /// Publish, waiting per the configured strategy while the ring is full.
    pub fn publish(&self, mut value: T) -> Result<u64> {
        let started = Instant::now();
        let mut spins = 0u32;
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(HeroError::Cancelled);
            }
            match self.try_publish(value) {
                Ok(seq) => return Ok(seq),
                Err(back) => value = back,
            }
            if !self.shared.wait_round(&mut spins, started) {
                return Err(HeroError::QueueFull("ring".into()));
            }
        }
    }

    /// Sequences published but not yet consumed by the slowest consumer.
    pub fn depth(&self) -> usize {
        let head = self.shared.next_seq.load(Ordering::Acquire);
        head.saturating_sub(self.shared.min_cursor()) as usize
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let _guard = self.shared.signal_lock.lock();
        self.shared.signal.notify_all();
    }
}

pub struct RingConsumer<T> {
    shared: Arc<RingShared<T>>,
    cursor: Arc<CachePadded<AtomicU64>>,
}

impl<T: Clone + Send + 'static> RingConsumer<T> {
    /// Read the next item if one is published.
    pub fn try_recv(&self) -> Option<(u64, T)> {
        let seq = self.cursor.load(Ordering::Relaxed);
        let slot = &self.shared.slots[(seq & self.shared.mask) as usize];
        if slot.sequence.load(Ordering::Acquire) != seq {
            return None;
        }
        // Safety: the marker matched our cursor, so the value is fully
        // written and cannot be overwritten until this cursor advances.
        let value = unsafe { (*slot.value.get()).clone() }?;
        self.cursor.store(seq + 1, Ordering::Release);
        self.shared.notify();
        Some((seq, value))
    }

    /// Read the next item, waiting per the configured strategy.
    ///
    /// Fails with `Timeout` when a `TimeoutBlocking` strategy runs dry and
    /// with `Cancelled` when the ring is closed and drained.
    pub fn recv(&self) -> Result<(u64, T)> {
        let started = Instant::now();
        let mut spins = 0u32;
        loop {
            if let Some(item) = self.try_recv() {
                return Ok(item);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // Drain anything published before the close raced us.
                if let Some(item) = self.try_recv() {
                    return Ok(item);
                }
                return Err(HeroError::Cancelled);
            }
            if !self.shared.wait_round(&mut spins, started) {
                return Err(HeroError::Timeout(match self.shared.wait {
                    WaitStrategy::TimeoutBlocking { timeout } => timeout,
                    _ => started.elapsed(),
                }));
            }
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }
}

impl<T> Drop for RingConsumer<T> {
    fn drop(&mut self) {
        // Deregister so a dropped consumer no longer stalls producers.
        let mut consumers = self.shared.consumers.write();
        consumers.retain(|c| !Arc::ptr_eq(c, &self.cursor));
        drop(consumers);
        let _guard = self.shared.signal_lock.lock();
        self.shared.signal.notify_all();
    }
}

// ============================================================================
// Async transport adapter
// ============================================================================

/// [`MessageTransport`] over a multi-producer ring buffer with a single
/// internal consumer, for hosts that want queue semantics with ring
/// latency.
pub struct RingTransport {
    name: String,
    producer: RingProducer<DynMessage>,
    consumer: tokio::sync::Mutex<RingConsumer<DynMessage>>,
    drop_when_full: bool,
    dropped: AtomicU64,
}

impl RingTransport {
    pub fn new(name: impl Into<String>, config: RingBufferConfig, drop_when_full: bool) -> Result<Self> {
        let (producer, consumer) = ring_buffer(config)?;
        Ok(Self {
            name: name.into(),
            producer,
            consumer: tokio::sync::Mutex::new(consumer),
            drop_when_full,
            dropped: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl MessageTransport for RingTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: DynMessage, ctx: &ProcessingContext) -> Result<()> {
        ctx.ensure_active()?;
        let mut message = message;
        loop {
            match self.producer.try_publish(message) {
                Ok(_) => {
                    metrics::counter!(
                        "heromessaging_transport_operations_total",
                        "transport" => self.name.clone(),
                        "status" => "sent"
                    )
                    .increment(1);
                    return Ok(());
                }
                Err(back) => {
                    if self.drop_when_full {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(
                            "heromessaging_transport_operations_total",
                            "transport" => self.name.clone(),
                            "status" => "dropped"
                        )
                        .increment(1);
                        warn!(
                            event = "queue.full",
                            transport = %self.name,
                            "Ring full, dropping message"
                        );
                        return Ok(());
                    }
                    ctx.ensure_active()?;
                    message = back;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn receive(&self, ctx: &ProcessingContext) -> Result<DynMessage> {
        let consumer = tokio::select! {
            _ = ctx.cancellation().cancelled() => return Err(HeroError::Cancelled),
            guard = self.consumer.lock() => guard,
        };
        loop {
            ctx.ensure_active()?;
            if let Some((_, message)) = consumer.try_recv() {
                metrics::counter!(
                    "heromessaging_transport_operations_total",
                    "transport" => self.name.clone(),
                    "status" => "received"
                )
                .increment(1);
                return Ok(message);
            }
            tokio::time::sleep(std::time::Duration::from_micros(50)).await;
        }
    }

    fn depth(&self) -> usize {
        self.producer.depth()
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_must_be_power_of_two() {
        let result = ring_buffer::<u64>(RingBufferConfig {
            capacity: 1000,
            ..Default::default()
        });
        assert!(matches!(result, Err(HeroError::Configuration(_))));
    }

    #[test]
    fn single_producer_fifo() {
        let (producer, consumer) = ring_buffer::<u64>(RingBufferConfig {
            capacity: 8,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::BusySpin,
        })
        .unwrap();

        for n in 0..8 {
            producer.try_publish(n).unwrap();
        }
        assert!(producer.try_publish(99).is_err());

        for n in 0..8 {
            let (seq, value) = consumer.try_recv().unwrap();
            assert_eq!(seq, n);
            assert_eq!(value, n);
        }
        assert!(consumer.try_recv().is_none());
    }

    #[test]
    fn wrap_around_reuses_slots() {
        let (producer, consumer) = ring_buffer::<u64>(RingBufferConfig {
            capacity: 4,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::BusySpin,
        })
        .unwrap();

        for round in 0..5u64 {
            for n in 0..4u64 {
                producer.try_publish(round * 4 + n).unwrap();
            }
            for n in 0..4u64 {
                let (_, value) = consumer.try_recv().unwrap();
                assert_eq!(value, round * 4 + n);
            }
        }
    }

    #[test]
    fn two_consumers_both_observe_every_item() {
        let (producer, first) = ring_buffer::<u32>(RingBufferConfig {
            capacity: 16,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::BusySpin,
        })
        .unwrap();
        let second = producer.add_consumer();

        for n in 0..10 {
            producer.try_publish(n).unwrap();
        }

        let drain = |c: &RingConsumer<u32>| {
            let mut seen = Vec::new();
            while let Some((_, v)) = c.try_recv() {
                seen.push(v);
            }
            seen
        };
        assert_eq!(drain(&first), (0..10).collect::<Vec<_>>());
        assert_eq!(drain(&second), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn slow_consumer_stalls_producer_until_dropped() {
        let (producer, consumer) = ring_buffer::<u32>(RingBufferConfig {
            capacity: 4,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::BusySpin,
        })
        .unwrap();

        for n in 0..4 {
            producer.try_publish(n).unwrap();
        }
        assert!(producer.try_publish(4).is_err());

        drop(consumer);
        // Without consumers the ring overwrites freely.
        assert!(producer.try_publish(4).is_ok());
    }

    #[test]
    fn timeout_blocking_recv_times_out() {
        let (_producer, consumer) = ring_buffer::<u32>(RingBufferConfig {
            capacity: 4,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::TimeoutBlocking {
                timeout: std::time::Duration::from_millis(20),
            },
        })
        .unwrap();

        assert!(matches!(consumer.recv(), Err(HeroError::Timeout(_))));
    }

    #[test]
    fn recv_after_close_drains_then_errors() {
        let (producer, consumer) = ring_buffer::<u32>(RingBufferConfig {
            capacity: 4,
            producer_mode: ProducerMode::Single,
            wait_strategy: WaitStrategy::Blocking,
        })
        .unwrap();

        producer.try_publish(1).unwrap();
        producer.close();

        assert_eq!(consumer.recv().unwrap().1, 1);
        assert!(matches!(consumer.recv(), Err(HeroError::Cancelled)));
    }
}
