//! Downstream WebSocket client.
//!
//! What an executor uses to talk to a running relay: it sends command and
//! term envelopes (the relay relabels them) and receives whatever the relay
//! forwards from upstream.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use relayline_protocol::Envelope;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{RelayError, Result};

pub struct DownstreamClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl DownstreamClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = connect_async(url).await?;
        info!("Connected to relay at {}", url);
        Ok(Self { socket })
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let line = envelope.to_line().map_err(RelayError::Encode)?;
        self.socket.send(Message::Text(line.into())).await?;
        Ok(())
    }

    /// Next envelope from the relay, or `None` once the connection ends.
    /// Frames that are not envelopes are logged and skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => match Envelope::from_line(text.as_str()) {
                    Ok(envelope) => return Some(envelope),
                    Err(e) => warn!("Skipping malformed frame from relay: {}", e),
                },
                Ok(Message::Close(_)) => return None,
                Ok(other) => debug!("Ignoring non-text frame ({} bytes)", other.len()),
                Err(e) => {
                    warn!("Relay connection failed: {}", e);
                    return None;
                }
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.socket.close(None).await?;
        Ok(())
    }
}
