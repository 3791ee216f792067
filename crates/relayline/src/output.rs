//! Diagnostic sink: the upstream side of the relay.
//!
//! The relay talks to its upstream host through newline-delimited JSON on
//! stdout (and stderr for `error` lines). Every line is one [`Envelope`]
//! tagged with the relay's own identity.

use std::sync::Arc;

use log::{debug, error};
use relayline_protocol::{Envelope, Lane, Payload};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{RelayError, Result};

/// Which stream a line is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkTarget {
    Stdout,
    Stderr,
}

/// Destination for newline-terminated JSON lines.
pub trait LineSink: Send + Sync {
    /// Write `line` followed by a newline.
    fn write_line(&self, target: SinkTarget, line: &str) -> std::io::Result<()>;
}

/// Writes to the process stdout and stderr from a dedicated task.
///
/// `write_line` only queues; the writer task owns both streams and flushes
/// after every line, so async callers never block on a full pipe.
#[derive(Debug, Clone)]
pub struct StdioSink {
    tx: mpsc::UnboundedSender<(SinkTarget, String)>,
}

impl StdioSink {
    /// Start a writer on the process stdout and stderr.
    ///
    /// The task ends once every clone of the sink is dropped and the queue
    /// has drained, or at the first write error.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        Self::with_writers(tokio::io::stdout(), tokio::io::stderr())
    }

    /// Like [`StdioSink::spawn`], writing to arbitrary streams.
    pub fn with_writers<O, E>(stdout: O, stderr: E) -> (Self, JoinHandle<()>)
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(rx, stdout, stderr));
        (Self { tx }, writer)
    }
}

async fn write_lines<O, E>(
    mut lines: mpsc::UnboundedReceiver<(SinkTarget, String)>,
    mut stdout: O,
    mut stderr: E,
) where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    while let Some((target, line)) = lines.recv().await {
        let result = match target {
            SinkTarget::Stdout => write_line_to(&mut stdout, &line).await,
            SinkTarget::Stderr => write_line_to(&mut stderr, &line).await,
        };
        if let Err(e) = result {
            error!("Failed to write {:?} line: {}", target, e);
            break;
        }
    }
    debug!("Stdio writer task ended");
}

async fn write_line_to<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> std::io::Result<()> {
    let line = format!("{line}\n");
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}

impl LineSink for StdioSink {
    fn write_line(&self, target: SinkTarget, line: &str) -> std::io::Result<()> {
        self.tx
            .send((target, line.to_string()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdio writer stopped"))
    }
}

/// Forwards lines to an unbounded queue, for embedding the relay in-process.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(SinkTarget, String)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SinkTarget, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LineSink for ChannelSink {
    fn write_line(&self, target: SinkTarget, line: &str) -> std::io::Result<()> {
        self.tx
            .send((target, line.to_string()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "line sink closed"))
    }
}

/// Emits envelopes tagged with one identity onto a [`LineSink`].
#[derive(Clone)]
pub struct Output {
    id: String,
    sink: Arc<dyn LineSink>,
}

impl Output {
    pub fn new(id: impl Into<String>, sink: Arc<dyn LineSink>) -> Self {
        Self {
            id: id.into(),
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log(&self, text: impl Into<String>) -> Result<()> {
        self.emit(SinkTarget::Stdout, Lane::Log, Payload::Text(text.into()))
    }

    pub fn error(&self, text: impl Into<String>) -> Result<()> {
        self.emit(SinkTarget::Stderr, Lane::Error, Payload::Text(text.into()))
    }

    pub fn message_command(&self, payload: Payload) -> Result<()> {
        self.emit(SinkTarget::Stdout, Lane::Command, payload)
    }

    pub fn message_term(&self, payload: Payload) -> Result<()> {
        self.emit(SinkTarget::Stdout, Lane::Term, payload)
    }

    fn emit(&self, target: SinkTarget, lane: Lane, payload: Payload) -> Result<()> {
        let line = Envelope::new(self.id.as_str(), lane, payload)
            .to_line()
            .map_err(RelayError::Encode)?;
        self.sink.write_line(target, &line)?;
        Ok(())
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output").field("id", &self.id).finish()
    }
}
