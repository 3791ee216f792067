//! The envelope exchanged on every duplex channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Lanes
// ============================================================================

/// Message class of an envelope.
///
/// `command` and `term` are the two multiplexed request/response lanes;
/// `log` and `error` are one-way diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    #[serde(rename = "log")]
    Log,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "message:command")]
    Command,
    #[serde(rename = "message:term")]
    Term,
}

impl Lane {
    /// Whether envelopes of this lane cross the relay (command and term only).
    pub fn is_relayed(self) -> bool {
        matches!(self, Self::Command | Self::Term)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Error => "error",
            Self::Command => "message:command",
            Self::Term => "message:term",
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Envelope payload: either plain text or a JSON object.
///
/// Command and term payloads are frequently a JSON document encoded as a
/// string; see [`crate::CommandPayload::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Object(Map<String, Value>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Text(_) => None,
            Self::Object(map) => Some(map),
        }
    }

    /// Convert an arbitrary JSON value. Only strings and objects are payloads.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::Text(text)),
            Value::Object(map) => Some(Self::Object(map)),
            _ => None,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self::Object(map)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// The unit exchanged on every duplex channel.
///
/// Wire shape: `{ "id": string, "type": lane, "payload": string | object }`.
/// Executors behind the relay often omit `id` (or send `""`); the relay
/// relabels those before forwarding, so a missing id decodes as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity of the endpoint owning the exchange (per session, not per message).
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub lane: Lane,

    pub payload: Payload,
}

impl Envelope {
    pub fn new(id: impl Into<String>, lane: Lane, payload: impl Into<Payload>) -> Self {
        Self {
            id: id.into(),
            lane,
            payload: payload.into(),
        }
    }

    pub fn command(id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::new(id, Lane::Command, payload)
    }

    pub fn term(id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self::new(id, Lane::Term, payload)
    }

    pub fn log(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, Lane::Log, Payload::Text(text.into()))
    }

    pub fn error(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, Lane::Error, Payload::Text(text.into()))
    }

    /// Same lane and payload under a different identity.
    pub fn relabel(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            lane: self.lane,
            payload: self.payload.clone(),
        }
    }

    /// Parse one frame (a line or a WebSocket text message).
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Serialize to a single line of JSON (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
