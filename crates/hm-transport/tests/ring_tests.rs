//! Multi-producer ring buffer integration tests.
//!
//! Covers the MPSC contract: a multi-producer ring with one consumer
//! delivers every published item exactly once with per-producer FIFO
//! preserved, and consumers never observe a torn write.

use std::collections::HashMap;
use std::thread;

use hm_transport::{ring_buffer, ProducerMode, RingBufferConfig, WaitStrategy};

const PRODUCERS: u64 = 4;
const PER_PRODUCER: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Item {
    producer: u64,
    n: u64,
    // Derived from the fields above; checked on the consumer side to
    // detect partially written payloads.
    checksum: u64,
}

impl Item {
    fn new(producer: u64, n: u64) -> Self {
        Self {
            producer,
            n,
            checksum: producer.wrapping_mul(1_000_003).wrapping_add(n),
        }
    }

    fn verify(&self) {
        assert_eq!(
            self.checksum,
            self.producer.wrapping_mul(1_000_003).wrapping_add(self.n),
            "torn read: {self:?}"
        );
    }
}

#[test]
fn mpsc_delivers_all_items_with_per_producer_fifo() {
    let (producer, consumer) = ring_buffer::<Item>(RingBufferConfig {
        capacity: 1024,
        producer_mode: ProducerMode::Multi,
        wait_strategy: WaitStrategy::Yielding,
    })
    .unwrap();

    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let producer = producer.clone();
        handles.push(thread::spawn(move || {
            for n in 0..PER_PRODUCER {
                producer.publish(Item::new(p, n)).unwrap();
            }
        }));
    }

    let consumer_handle = thread::spawn(move || {
        let mut last_seen: HashMap<u64, u64> = HashMap::new();
        let mut total = 0u64;
        while total < PRODUCERS * PER_PRODUCER {
            let (_, item) = consumer.recv().unwrap();
            item.verify();
            let expected = last_seen.entry(item.producer).or_insert(0);
            assert_eq!(item.n, *expected, "per-producer FIFO violated");
            *expected += 1;
            total += 1;
        }
        (total, last_seen)
    });

    for handle in handles {
        handle.join().unwrap();
    }
    let (total, last_seen) = consumer_handle.join().unwrap();

    assert_eq!(total, PRODUCERS * PER_PRODUCER);
    for p in 0..PRODUCERS {
        assert_eq!(last_seen.get(&p), Some(&PER_PRODUCER));
    }
}

#[test]
fn blocking_strategy_under_contention() {
    let (producer, consumer) = ring_buffer::<u64>(RingBufferConfig {
        capacity: 64,
        producer_mode: ProducerMode::Multi,
        wait_strategy: WaitStrategy::Blocking,
    })
    .unwrap();

    let writer = {
        let producer = producer.clone();
        thread::spawn(move || {
            for n in 0..10_000u64 {
                producer.publish(n).unwrap();
            }
            producer.close();
        })
    };

    let mut sum = 0u64;
    let mut count = 0u64;
    loop {
        match consumer.recv() {
            Ok((_, v)) => {
                sum += v;
                count += 1;
            }
            Err(_) => break,
        }
    }

    writer.join().unwrap();
    assert_eq!(count, 10_000);
    assert_eq!(sum, (0..10_000u64).sum::<u64>());
}
