//! Outbox/inbox engine integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use hm_core::{Command, HeroError, ManualClock, Message, MessageKind, ProcessingContext};
use hm_core::DynMessage;
use hm_outbox::{
    InMemoryDeadLetterQueue, InMemoryInboxStorage, InMemoryOutboxStorage, InboxOutcome,
    InboxProcessor, InboxStorage, OutboxEntryState, OutboxOptions, OutboxProcessor,
    OutboxProcessorConfig, OutboxStorage,
};
use hm_pipeline::{
    CommandHandler, EventDispatchMode, HandlerRegistry, MessageDispatcher, NoopTransactionFactory,
    RetryPolicy,
};

#[derive(Debug, Clone)]
struct ShipParcel {
    parcel: String,
}
impl Message for ShipParcel {
    fn message_type() -> &'static str {
        "ShipParcel"
    }
}
impl Command for ShipParcel {}

/// Handler that fails transiently a configured number of times per parcel.
struct FlakyShipper {
    shipped: Arc<Mutex<Vec<String>>>,
    failures_remaining: Arc<AtomicU32>,
}

#[async_trait]
impl CommandHandler<ShipParcel> for FlakyShipper {
    async fn handle(&self, command: &ShipParcel, _ctx: &ProcessingContext) -> anyhow::Result<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!(HeroError::Timeout(Duration::from_millis(50)));
        }
        self.shipped.lock().push(command.parcel.clone());
        Ok(())
    }
}

struct Fixture {
    storage: Arc<InMemoryOutboxStorage>,
    dlq: Arc<InMemoryDeadLetterQueue>,
    processor: OutboxProcessor,
    clock: ManualClock,
    shipped: Arc<Mutex<Vec<String>>>,
}

fn fixture(failures: u32, max_retries: u32) -> Fixture {
    let shipped = Arc::new(Mutex::new(Vec::new()));
    let failures_remaining = Arc::new(AtomicU32::new(failures));

    let mut registry = HandlerRegistry::new();
    registry
        .register_command::<ShipParcel, _>(FlakyShipper {
            shipped: Arc::clone(&shipped),
            failures_remaining,
        })
        .unwrap();
    let dispatcher = MessageDispatcher::new(registry, EventDispatchMode::Sequential);

    let storage = Arc::new(InMemoryOutboxStorage::new());
    let dlq = Arc::new(InMemoryDeadLetterQueue::new());
    let clock = ManualClock::starting_now();
    let processor = OutboxProcessor::new(
        OutboxProcessorConfig {
            max_retries,
            retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10)),
            ..Default::default()
        },
        Arc::clone(&storage) as Arc<dyn OutboxStorage>,
        dispatcher,
        Arc::clone(&dlq) as _,
    )
    .with_clock(Arc::new(clock.clone()));

    Fixture {
        storage,
        dlq,
        processor,
        clock,
        shipped,
    }
}

fn parcel(name: &str) -> DynMessage {
    DynMessage::new(
        MessageKind::Command,
        ShipParcel {
            parcel: name.into(),
        },
    )
}

#[tokio::test]
async fn pending_entry_is_delivered_and_marked_processed() {
    let fx = fixture(0, 3);
    fx.storage
        .add(parcel("p-1"), OutboxOptions::default())
        .await
        .unwrap();

    let stats = fx.processor.poll_once().await.unwrap();
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(fx.shipped.lock().as_slice(), ["p-1"]);
    assert_eq!(fx.storage.count_in_state(OutboxEntryState::Processed), 1);
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let fx = fixture(1, 3);
    fx.storage
        .add(parcel("p-2"), OutboxOptions::default())
        .await
        .unwrap();

    // First poll fails transiently and schedules a retry.
    let stats = fx.processor.poll_once().await.unwrap();
    assert_eq!(stats.retried, 1);
    assert_eq!(fx.storage.count_in_state(OutboxEntryState::Pending), 1);

    // Not due yet: nothing claimed.
    let stats = fx.processor.poll_once().await.unwrap();
    assert_eq!(stats.claimed, 0);

    // Past the backoff the entry is claimed again and delivers.
    fx.clock.advance(Duration::from_secs(30));
    let stats = fx.processor.poll_once().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(fx.shipped.lock().as_slice(), ["p-2"]);
}

/// Invariant: every pending entry eventually ends Processed or in the DLQ.
#[tokio::test]
async fn exhausted_retries_escalate_to_dead_letter_queue() {
    let fx = fixture(10, 2);
    fx.storage
        .add(parcel("p-3"), OutboxOptions::default())
        .await
        .unwrap();

    for _ in 0..4 {
        fx.processor.poll_once().await.unwrap();
        fx.clock.advance(Duration::from_secs(60));
    }

    assert_eq!(fx.storage.count_in_state(OutboxEntryState::Failed), 1);
    assert_eq!(fx.dlq.len(), 1);
    let letters = fx.dlq.drain();
    assert!(letters[0].reason.contains("retries exhausted"));
    assert!(fx.shipped.lock().is_empty());
}

#[tokio::test]
async fn permanent_failure_dead_letters_without_retry() {
    struct Rejecting;

    #[async_trait]
    impl CommandHandler<ShipParcel> for Rejecting {
        async fn handle(&self, _c: &ShipParcel, _ctx: &ProcessingContext) -> anyhow::Result<()> {
            anyhow::bail!(HeroError::Validation("unknown parcel format".into()));
        }
    }

    let mut registry = HandlerRegistry::new();
    registry.register_command::<ShipParcel, _>(Rejecting).unwrap();
    let dispatcher = MessageDispatcher::new(registry, EventDispatchMode::Sequential);

    let storage = Arc::new(InMemoryOutboxStorage::new());
    let dlq = Arc::new(InMemoryDeadLetterQueue::new());
    let processor = OutboxProcessor::new(
        OutboxProcessorConfig::default(),
        Arc::clone(&storage) as Arc<dyn OutboxStorage>,
        dispatcher,
        Arc::clone(&dlq) as _,
    );

    storage
        .add(parcel("p-4"), OutboxOptions::default())
        .await
        .unwrap();
    let stats = processor.poll_once().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(dlq.len(), 1);
}

#[tokio::test]
async fn deliveries_preserve_created_at_order() {
    let fx = fixture(0, 3);
    for n in 0..5 {
        fx.storage
            .add(parcel(&format!("p-{n}")), OutboxOptions::default())
            .await
            .unwrap();
    }

    fx.processor.poll_once().await.unwrap();
    let shipped = fx.shipped.lock();
    let expected: Vec<String> = (0..5).map(|n| format!("p-{n}")).collect();
    assert_eq!(shipped.as_slice(), expected.as_slice());
}

// ============================================================================
// Inbox
// ============================================================================

#[tokio::test]
async fn inbox_discards_duplicate_deliveries() {
    let handled = Arc::new(Mutex::new(Vec::new()));

    struct CountingShipper {
        handled: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CommandHandler<ShipParcel> for CountingShipper {
        async fn handle(&self, c: &ShipParcel, _ctx: &ProcessingContext) -> anyhow::Result<()> {
            self.handled.lock().push(c.parcel.clone());
            Ok(())
        }
    }

    let mut registry = HandlerRegistry::new();
    registry
        .register_command::<ShipParcel, _>(CountingShipper {
            handled: Arc::clone(&handled),
        })
        .unwrap();
    let dispatcher = MessageDispatcher::new(registry, EventDispatchMode::Sequential);

    let factory = Arc::new(NoopTransactionFactory::new());
    let inbox = InboxProcessor::new(
        Arc::new(InMemoryInboxStorage::new(Some(Duration::from_secs(3600)))),
        dispatcher,
    )
    .with_transactions(factory.clone());

    let ctx = ProcessingContext::new();
    let message = parcel("p-dup");

    // Same message id delivered three times: the handler runs once.
    assert!(matches!(
        inbox.process(&message, &ctx).await.unwrap(),
        InboxOutcome::Handled(_)
    ));
    assert!(matches!(
        inbox.process(&message, &ctx).await.unwrap(),
        InboxOutcome::Duplicate
    ));
    assert!(matches!(
        inbox.process(&message, &ctx).await.unwrap(),
        InboxOutcome::Duplicate
    ));

    assert_eq!(handled.lock().len(), 1);
    assert_eq!(factory.committed(), 1);
}

#[tokio::test]
async fn inbox_failure_rolls_back_and_marks_failed() {
    struct Broken;

    #[async_trait]
    impl CommandHandler<ShipParcel> for Broken {
        async fn handle(&self, _c: &ShipParcel, _ctx: &ProcessingContext) -> anyhow::Result<()> {
            anyhow::bail!("carrier unavailable");
        }
    }

    let mut registry = HandlerRegistry::new();
    registry.register_command::<ShipParcel, _>(Broken).unwrap();
    let dispatcher = MessageDispatcher::new(registry, EventDispatchMode::Sequential);

    let storage = Arc::new(InMemoryInboxStorage::new(None));
    let factory = Arc::new(NoopTransactionFactory::new());
    let inbox = InboxProcessor::new(Arc::clone(&storage) as _, dispatcher)
        .with_transactions(factory.clone());

    let message = parcel("p-broken");
    let result = inbox.process(&message, &ProcessingContext::new()).await;
    assert!(result.is_err());
    assert_eq!(factory.rolled_back(), 1);

    let entry = storage.get(message.message_id()).await.unwrap().unwrap();
    assert_eq!(entry.state, hm_outbox::InboxEntryState::Failed);
}
