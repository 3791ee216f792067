//! Correlated command payloads.
//!
//! A request carries `{ ...fields, seq }`. The executor echoes `seq` in every
//! response; a response with `next: true` announces that more will follow,
//! anything else ends the exchange.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::Payload;

/// Inner payload of a correlated command or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Correlation token assigned by the requester.
    pub seq: u64,

    /// `Some(true)` when more responses for this `seq` follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<bool>,

    /// Domain fields (command name, paths, content, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandPayload {
    pub fn new(seq: u64, fields: Map<String, Value>) -> Self {
        Self {
            seq,
            next: None,
            fields,
        }
    }

    /// Mark this payload as an intermediate response.
    pub fn with_next(mut self) -> Self {
        self.next = Some(true);
        self
    }

    /// Whether this payload ends its response sequence.
    pub fn is_final(&self) -> bool {
        self.next != Some(true)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Encode request fields plus `seq` as the JSON string carried on the wire.
    ///
    /// A `seq` already present in `fields` is overwritten.
    pub fn encode(fields: &Map<String, Value>, seq: u64) -> serde_json::Result<String> {
        let mut object = fields.clone();
        object.insert("seq".to_string(), Value::from(seq));
        serde_json::to_string(&object)
    }

    /// Decode from either an object payload or a JSON-encoded string payload.
    pub fn decode(payload: &Payload) -> serde_json::Result<Self> {
        match payload {
            Payload::Text(text) => serde_json::from_str(text),
            Payload::Object(map) => serde_json::from_value(Value::Object(map.clone())),
        }
    }

    /// Encode as an object payload, for executors answering a request.
    pub fn to_payload(&self) -> serde_json::Result<Payload> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(Payload::Object(map)),
            // flatten of a map with a required u64 always yields an object
            other => Ok(Payload::Text(other.to_string())),
        }
    }
}
