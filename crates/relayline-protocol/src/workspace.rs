//! Workspace commands carried on the command lane.
//!
//! These are what a host and an executor typically exchange through the
//! relay: the executor announces `setup` and preview URLs, the host pushes file
//! contents and pulls them back. The relay never looks inside them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum WorkspaceCommand {
    /// Executor is connected and ready for files.
    Setup,

    /// Executor started a server reachable at `preview_url`.
    #[serde(rename_all = "camelCase")]
    AddPreviewUrl { preview_url: String },

    /// Write `content` to `path` (absolute, `/`-separated).
    UpdateContent {
        kind: EntryKind,
        path: String,
        content: Vec<u8>,
    },

    /// Ask for the content of one file; answered with `UpdateContent`.
    PickFile { kind: EntryKind, path: String },

    /// Ask for every file below `path`; answered with `Entries`.
    PickAllFiles { kind: EntryKind, path: String },

    /// Relative paths of files found below `path`.
    Entries {
        kind: EntryKind,
        path: String,
        entries: Vec<String>,
    },
}

impl WorkspaceCommand {
    /// Request fields for [`crate::CommandPayload::encode`].
    pub fn to_fields(&self) -> serde_json::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "workspace command serialized to non-object: {other}"
            ))),
        }
    }

    /// Read a command back out of correlated fields, ignoring `seq`/`next`.
    pub fn from_fields(fields: &Map<String, Value>) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(fields.clone()))
    }
}
