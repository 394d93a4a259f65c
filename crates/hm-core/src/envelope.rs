//! Message envelope: identity, causation, correlation, metadata.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, MessageKind};

/// Envelope metadata. Known hot-path keys are typed fields; anything else
/// goes in the lazily allocated `extra` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Opaque tracing bytes, preserved verbatim across hops.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, serde_json::Value>>,
}

impl Metadata {
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.extra
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.as_ref().and_then(|extra| extra.get(key))
    }
}

/// Identity and lineage for one message.
///
/// The `message_id` is assigned once at construction and never changes;
/// `causation_id` and `correlation_id` are stamped by the processing
/// context when a handler publishes follow-on messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: Metadata::default(),
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

/// A type-erased message: envelope plus shared payload.
///
/// Cloning is cheap (the payload is behind an `Arc`), which is what event
/// fan-out and batching rely on.
#[derive(Clone)]
pub struct DynMessage {
    pub envelope: Envelope,
    pub kind: MessageKind,
    payload: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl DynMessage {
    pub fn new<M: Message>(kind: MessageKind, payload: M) -> Self {
        Self::with_envelope(Envelope::new(), kind, payload)
    }

    pub fn with_envelope<M: Message>(envelope: Envelope, kind: MessageKind, payload: M) -> Self {
        Self {
            envelope,
            kind,
            payload: Arc::new(payload),
            type_id: TypeId::of::<M>(),
            type_name: M::message_type(),
        }
    }

    pub fn payload_type(&self) -> TypeId {
        self.type_id
    }

    pub fn message_type(&self) -> &'static str {
        self.type_name
    }

    pub fn message_id(&self) -> Uuid {
        self.envelope.message_id()
    }

    /// Borrow the payload as its concrete type.
    pub fn payload_ref<M: Message>(&self) -> Option<&M> {
        self.payload.downcast_ref::<M>()
    }

    /// Clone out a shared handle to the payload as its concrete type.
    pub fn payload_arc<M: Message>(&self) -> Option<Arc<M>> {
        Arc::clone(&self.payload).downcast::<M>().ok()
    }
}

impl std::fmt::Debug for DynMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynMessage")
            .field("message_id", &self.envelope.message_id())
            .field("kind", &self.kind)
            .field("message_type", &self.type_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping {
        n: u32,
    }
    impl Message for Ping {}

    struct Pong;
    impl Message for Pong {}

    #[test]
    fn message_id_survives_clone() {
        let msg = DynMessage::new(MessageKind::Command, Ping { n: 1 });
        let copy = msg.clone();
        assert_eq!(msg.message_id(), copy.message_id());
    }

    #[test]
    fn payload_downcast_by_concrete_type() {
        let msg = DynMessage::new(MessageKind::Command, Ping { n: 7 });
        assert_eq!(msg.payload_ref::<Ping>().map(|p| p.n), Some(7));
        assert!(msg.payload_ref::<Pong>().is_none());
    }

    #[test]
    fn metadata_extra_map_is_lazy() {
        let mut metadata = Metadata::default();
        assert!(metadata.extra.is_none());
        metadata.insert("tenant", serde_json::json!("acme"));
        assert_eq!(metadata.get("tenant"), Some(&serde_json::json!("acme")));
    }

    #[test]
    fn envelope_serde_round_trip() {
        let envelope = Envelope::new().with_correlation("workflow-1");
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope, back);
        assert_eq!(envelope.message_id(), back.message_id());
        assert_eq!(envelope.timestamp, back.timestamp);
    }
}
