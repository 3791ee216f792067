//! Message relay with request/response correlation.
//!
//! A relay process sits between one upstream pipe (its stdin/stdout) and any
//! number of downstream WebSocket executors. A host on the upstream side uses
//! a [`Correlator`] to send commands through the relay and receive their
//! (possibly multi-part) responses, while terminal traffic flows through
//! uncorrelated.

pub mod chan;
pub mod client;
pub mod config;
pub mod connector;
pub mod correlator;
pub mod error;
pub mod output;
pub mod server;

pub use chan::{ChanClosed, ChanReceiver, ChanSender, SharedStream, Subscription, chan};
pub use client::DownstreamClient;
pub use config::RelayConfig;
pub use connector::{ConnectionInfo, Connector, gather_lines};
pub use correlator::{ChannelTransport, Correlator, LineTransport, ResponseStream, Transport};
pub use error::{RelayError, Result};
pub use output::{ChannelSink, LineSink, Output, SinkTarget, StdioSink};
pub use server::{Relay, RelayState};

pub use relayline_protocol as protocol;
