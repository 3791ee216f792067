//! Wire types for the relayline protocol.
//!
//! Every participant (host, relay, executor) exchanges [`Envelope`]s framed as
//! one JSON document per line or per WebSocket text frame. The relay layer only
//! looks at `id` and `type`; the payload is opaque to it. Request/response
//! correlation lives in [`CommandPayload`], carried inside command envelopes.

pub mod command;
pub mod envelope;
pub mod term;
pub mod workspace;

pub use command::CommandPayload;
pub use envelope::{Envelope, Lane, Payload};
pub use term::TermPayload;
pub use workspace::{EntryKind, WorkspaceCommand};
