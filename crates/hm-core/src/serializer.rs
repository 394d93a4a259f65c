//! Serializer port and the default JSON implementation.
//!
//! Payloads are type-erased at the pipeline boundary, so the wire unit is
//! a [`WireMessage`]: the envelope verbatim plus the payload captured as a
//! self-describing value. Round-trips preserve the message id, the UTC
//! timestamp at full precision, the metadata map and all domain fields.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::HeroError;
use crate::message::{Message, MessageKind};

/// Serialized form of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub envelope: Envelope,
    pub kind: MessageKind,
    pub message_type: String,
    pub body: serde_json::Value,
}

impl WireMessage {
    /// Capture a typed payload alongside its envelope.
    pub fn encode<M>(envelope: Envelope, kind: MessageKind, payload: &M) -> Result<Self, HeroError>
    where
        M: Message + Serialize,
    {
        let body = serde_json::to_value(payload)
            .map_err(|e| HeroError::Serialization(e.to_string()))?;
        Ok(Self {
            envelope,
            kind,
            message_type: M::message_type().to_string(),
            body,
        })
    }

    /// Recover the typed payload. Fails with a version error when the wire
    /// type name does not match the requested type.
    pub fn decode<M>(&self) -> Result<M, HeroError>
    where
        M: Message + DeserializeOwned,
    {
        if self.message_type != M::message_type() {
            return Err(HeroError::SerializationVersion(format!(
                "expected '{}', found '{}'",
                M::message_type(),
                self.message_type
            )));
        }
        serde_json::from_value(self.body.clone())
            .map_err(|e| HeroError::Serialization(e.to_string()))
    }
}

pub trait Serializer: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn serialize(&self, message: &WireMessage) -> Result<Bytes, HeroError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<WireMessage, HeroError>;

    /// Exact byte length needed for `message`, when the format can know it
    /// up front. Used by zero-copy paths renting pooled buffers.
    fn required_buffer_size(&self, _message: &WireMessage) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, message: &WireMessage) -> Result<Bytes, HeroError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| HeroError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<WireMessage, HeroError> {
        serde_json::from_slice(bytes).map_err(|e| HeroError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        total_cents: i64,
    }
    impl Message for OrderPlaced {
        fn message_type() -> &'static str {
            "OrderPlaced"
        }
    }

    #[test]
    fn round_trip_preserves_documented_fields() {
        let envelope = Envelope::new().with_correlation("wf-42");
        let payload = OrderPlaced {
            order_id: "o-1".into(),
            total_cents: 9999,
        };
        let wire = WireMessage::encode(envelope.clone(), MessageKind::Event, &payload).unwrap();

        let serializer = JsonSerializer;
        let bytes = serializer.serialize(&wire).unwrap();
        let back = serializer.deserialize(&bytes).unwrap();

        assert_eq!(back.envelope.message_id(), envelope.message_id());
        assert_eq!(back.envelope.timestamp, envelope.timestamp);
        assert_eq!(back.envelope.correlation_id, envelope.correlation_id);
        assert_eq!(back.decode::<OrderPlaced>().unwrap(), payload);
    }

    #[test]
    fn decode_wrong_type_is_a_version_error() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Other;
        impl Message for Other {
            fn message_type() -> &'static str {
                "Other"
            }
        }

        let wire = WireMessage::encode(
            Envelope::new(),
            MessageKind::Event,
            &OrderPlaced {
                order_id: "o-2".into(),
                total_cents: 1,
            },
        )
        .unwrap();

        assert!(matches!(
            wire.decode::<Other>(),
            Err(HeroError::SerializationVersion(_))
        ));
    }
}
