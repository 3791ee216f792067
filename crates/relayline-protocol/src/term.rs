//! Terminal lane payloads.
//!
//! The term lane is not correlated: the executor announces `setup` once its
//! shell is attached, streams `out` chunks, and accepts `in` and `size`.

use serde::{Deserialize, Serialize};

use crate::envelope::Payload;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum TermPayload {
    /// Executor side is ready to accept input.
    Setup,
    /// Keystrokes for the shell.
    In { data: String },
    /// Shell output.
    Out { data: String },
    /// Resize the terminal.
    Size { cols: u16, rows: u16 },
}

impl TermPayload {
    /// Term payloads travel as JSON-encoded strings.
    pub fn to_payload(&self) -> serde_json::Result<Payload> {
        serde_json::to_string(self).map(Payload::Text)
    }

    pub fn from_payload(payload: &Payload) -> serde_json::Result<Self> {
        match payload {
            Payload::Text(text) => serde_json::from_str(text),
            Payload::Object(map) => serde_json::from_value(serde_json::Value::Object(map.clone())),
        }
    }
}
