//! Wire envelope handed to transport adapters.
//!
//! The layout is bit-stable: external broker adapters serialize this
//! struct, and `trace_context` bytes cross hops verbatim.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use hm_core::{HeroError, Serializer, WireMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    pub message_type: String,
    pub body: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<Vec<u8>>,
}

impl TransportEnvelope {
    /// Wrap a wire message for an external hop using the given serializer.
    pub fn from_wire(
        serializer: &dyn Serializer,
        wire: &WireMessage,
    ) -> Result<Self, HeroError> {
        let body = serializer.serialize(wire)?;
        Ok(Self {
            message_type: wire.message_type.clone(),
            body: body.to_vec(),
            message_id: Some(wire.envelope.message_id().to_string()),
            correlation_id: wire.envelope.correlation_id.clone(),
            causation_id: wire.envelope.causation_id.clone(),
            headers: HashMap::new(),
            trace_context: wire.envelope.metadata.trace_context.clone(),
        })
    }

    /// Recover the wire message from the body bytes.
    pub fn to_wire(&self, serializer: &dyn Serializer) -> Result<WireMessage, HeroError> {
        serializer.deserialize(&self.body)
    }
}
