//! Core message model and ports for HeroMessaging.
//!
//! Everything the higher layers share lives here: the message envelope with
//! correlation/causation identity, the explicit processing context that
//! replaces ambient state, the clock/serializer/buffer-pool/storage ports,
//! and the error taxonomy surfaced by every public operation.

pub mod buffer_pool;
pub mod clock;
pub mod context;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod message;
pub mod serializer;
pub mod storage;

pub use buffer_pool::{BufferPool, PooledBuffer, SizedBufferPool, SizedBufferPoolConfig};
pub use clock::{create_timer, Clock, ManualClock, SystemClock, TimerHandle};
pub use context::ProcessingContext;
pub use envelope::{DynMessage, Envelope, Metadata};
pub use error::{HeroError, StorageErrorClass};
pub use message::{Command, Event, Message, MessageKind, Query};
pub use serializer::{JsonSerializer, Serializer, WireMessage};
pub use storage::{
    InMemoryMessageStorage, IsolationLevel, MessageFilter, MessageStorage, StorageTransaction,
};

pub type Result<T> = std::result::Result<T, HeroError>;
