//! Router between one upstream pipe and many downstream WebSocket channels.
//!
//! Upstream envelopes are read from the shared inbound stream and relayed to
//! a downstream channel when they carry this router's own id or travel on
//! the term lane. Envelopes coming from downstream are relabeled with the
//! router's id and written upstream through the diagnostic sink. Only the
//! command and term lanes cross the relay in either direction.

use std::fmt::Display;
use std::pin::pin;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use relayline_protocol::{Envelope, Lane};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::wrappers::LinesStream;
use uuid::Uuid;

use crate::chan::{SharedStream, Subscription};
use crate::error::{RelayError, Result};
use crate::output::{LineSink, Output};

/// Length of a generated router id.
const ID_LEN: usize = 12;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// An attached downstream channel.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub peer: Option<String>,
    pub connected_at: SystemTime,
}

pub struct Connector {
    id: String,
    output: Output,
    connections: DashMap<Uuid, ConnectionInfo>,
}

impl Connector {
    /// Create a router with a fresh random id.
    pub fn new(sink: Arc<dyn LineSink>) -> Self {
        Self::with_id(generate_id(), sink)
    }

    pub fn with_id(id: impl Into<String>, sink: Arc<dyn LineSink>) -> Self {
        let id = id.into();
        Self {
            output: Output::new(id.as_str(), sink),
            id,
            connections: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    /// Whether an upstream envelope goes to downstream channels.
    pub fn should_relay(&self, envelope: &Envelope) -> bool {
        envelope.id == self.id || envelope.lane == Lane::Term
    }

    pub fn attach(&self, peer: Option<String>) -> Uuid {
        let id = Uuid::new_v4();
        info!(
            "Attached downstream connection {} ({})",
            id,
            peer.as_deref().unwrap_or("unknown peer")
        );
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                peer,
                connected_at: SystemTime::now(),
            },
        );
        id
    }

    pub fn detach(&self, id: Uuid) -> Option<ConnectionInfo> {
        let removed = self.connections.remove(&id).map(|(_, info)| info);
        if removed.is_some() {
            info!("Detached downstream connection {}", id);
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Relay matching upstream envelopes into `sink` until the shared stream
    /// ends. Fails with [`RelayError::Closed`] when the downstream side goes
    /// away first.
    pub async fn serve_upstream<S>(
        &self,
        sink: S,
        mut subscription: Subscription<Envelope>,
    ) -> Result<()>
    where
        S: Sink<String>,
        S::Error: Display,
    {
        let mut sink = pin!(sink);
        while let Some(envelope) = subscription.recv().await {
            if !self.should_relay(&envelope) {
                continue;
            }
            let line = envelope.to_line().map_err(RelayError::Encode)?;
            if let Err(e) = sink.send(line).await {
                debug!("Downstream sink closed: {}", e);
                return Err(RelayError::Closed);
            }
        }
        Ok(())
    }

    /// Relay frames from one downstream channel upstream until it closes.
    /// The first undecodable frame ends the loop with an error.
    pub async fn serve_downstream<F>(&self, frames: F) -> Result<()>
    where
        F: Stream<Item = String>,
    {
        let mut frames = pin!(frames);
        while let Some(frame) = frames.next().await {
            self.relay_downstream(&frame)?;
        }
        Ok(())
    }

    /// Relabel one downstream frame and write it upstream.
    pub fn relay_downstream(&self, frame: &str) -> Result<()> {
        let Some(envelope) = parse_relayed(frame, "downstream frame")? else {
            return Ok(());
        };
        match envelope.lane {
            Lane::Command => self.output.message_command(envelope.payload),
            Lane::Term => self.output.message_term(envelope.payload),
            Lane::Log | Lane::Error => Ok(()),
        }
    }

    /// Run both relay directions for one downstream channel.
    ///
    /// The channel is registered for the duration of the call. Whichever side
    /// ends first ends the other. Any failure other than the channel closing
    /// is reported as an `error` line upstream and returned.
    pub async fn handle<S, F>(
        &self,
        sink: S,
        frames: F,
        subscription: Subscription<Envelope>,
        peer: Option<String>,
    ) -> Result<()>
    where
        S: Sink<String>,
        S::Error: Display,
        F: Stream<Item = String>,
    {
        let conn_id = self.attach(peer);

        let result = tokio::select! {
            result = self.serve_upstream(sink, subscription) => result,
            result = self.serve_downstream(frames) => result,
        };

        self.detach(conn_id);
        if let Err(e) = self.output.log("Client disconnected") {
            warn!("Failed to write disconnect notice: {}", e);
        }

        match result {
            Ok(()) | Err(RelayError::Closed) => Ok(()),
            Err(e) => {
                let report = if e.is_decode() {
                    format!("Server: parse a message: {e}")
                } else {
                    format!("Server: {e}")
                };
                if let Err(write_err) = self.output.error(report) {
                    warn!("Failed to report relay error: {}", write_err);
                }
                Err(e)
            }
        }
    }

    /// Ingest the upstream pipe into the shared inbound stream.
    pub async fn gather<R>(&self, reader: R, inbound: &SharedStream<Envelope>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        info!("Router {} reading upstream", self.id);
        gather_lines(reader, inbound).await
    }
}

/// Read newline-delimited envelopes from `reader` and publish the command and
/// term ones. Returns at EOF; the first unparseable line is an error and
/// nothing from it is published.
pub async fn gather_lines<R>(reader: R, inbound: &SharedStream<Envelope>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    while let Some(line) = lines.next().await {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(envelope) = parse_relayed(line, "upstream line")? {
            inbound.publish(envelope);
        }
    }
    debug!("Upstream reached EOF");
    Ok(())
}

/// Parse a line and keep it only when it travels on a relayed lane.
///
/// Frames on other lanes (including names this crate does not know) are
/// skipped. Invalid JSON, or a relayed frame with an invalid shape, is a
/// decode error.
fn parse_relayed(line: &str, context: &'static str) -> Result<Option<Envelope>> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| RelayError::decode(context, e))?;
    let relayed = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|lane| lane == Lane::Command.as_str() || lane == Lane::Term.as_str());
    if !relayed {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| RelayError::decode(context, e))
}

fn generate_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}
