//! WebSocket Message Types
//!
//! The hub speaks one wire format in both directions:
//!
//! ```json
//! {"type": "chat", "payload": {"text": "hello"}}
//! ```
//!
//! `payload` is kept as raw JSON text. The hub never interprets it; only
//! handlers do. A missing or `null` type decodes as the empty string, which
//! no built-in handler claims, so such messages are relayed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// A single message relayed through the hub
///
/// Immutable once constructed. Two messages are equal when their types
/// match and their payloads are byte-identical JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message type tag, used for handler lookup
    #[serde(rename = "type", default, deserialize_with = "null_as_empty")]
    kind: String,
    /// Opaque JSON payload
    #[serde(default = "null_payload")]
    payload: Box<RawValue>,
}

fn null_payload() -> Box<RawValue> {
    RawValue::NULL.to_owned()
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    /// Create a message by serializing `payload`
    pub fn new<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::value::to_raw_value(payload)?,
        })
    }

    /// Create a message from payload text that is already JSON
    ///
    /// The text is validated but kept verbatim.
    pub fn from_raw(kind: impl Into<String>, payload: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            payload: RawValue::from_string(payload.to_string())?,
        })
    }

    /// Decode a message from a text or binary frame body
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode the message as wire JSON
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The message type tag
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The raw payload JSON text
    pub fn payload(&self) -> &str {
        self.payload.get()
    }

    /// Deserialize the payload into a concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.payload.get())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.payload.get() == other.payload.get()
    }
}

impl Eq for Message {}
