//! Outbox and inbox engines: at-least-once delivery with deduplication,
//! retry and failure escalation.
//!
//! The outbox side persists outbound messages next to the business state
//! that produced them, then a background processor claims pending entries
//! and pushes them through the dispatcher pipeline, retrying with backoff
//! and escalating exhausted entries to the dead-letter sink. The inbox
//! side gives at-most-once handler semantics on top of at-least-once
//! transport by deduplicating on message id.

pub mod dlq;
pub mod inbox;
pub mod processor;
pub mod storage;

pub use dlq::{DeadLetter, DeadLetterSink, InMemoryDeadLetterQueue};
pub use inbox::{
    InboxEntry, InboxEntryState, InboxOutcome, InboxProcessor, InboxStorage, InMemoryInboxStorage,
};
pub use processor::{OutboxProcessor, OutboxProcessorConfig, PollStats};
pub use storage::{
    InMemoryOutboxStorage, OutboxEntry, OutboxEntryState, OutboxOptions, OutboxStorage,
};
