//! WebSocket listener for downstream executors.
//!
//! The relay process binds one port, accepts any number of WebSocket
//! connections on `/` (or `/ws`) and hands each to the [`Connector`]. The
//! upstream side is whatever reader is passed to [`Relay::run`], normally the
//! process stdin.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::stream::SplitStream;
use futures::{SinkExt, Stream, StreamExt, future};
use log::{debug, error, info, warn};
use relayline_protocol::Envelope;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use crate::chan::SharedStream;
use crate::connector::Connector;
use crate::error::Result;
use crate::output::LineSink;

/// Shared state handed to every request.
#[derive(Clone)]
pub struct RelayState {
    pub connector: Arc<Connector>,
    pub inbound: SharedStream<Envelope>,
}

impl RelayState {
    pub fn new(connector: Connector) -> Self {
        Self {
            connector: Arc::new(connector),
            inbound: SharedStream::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    id: String,
    connections: usize,
}

pub fn create_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        id: state.connector.id().to_string(),
        connections: state.connector.connection_count(),
    })
}

/// WebSocket upgrade handler.
///
/// GET / and GET /ws
async fn ws_handler(
    State(state): State<RelayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!("WebSocket upgrade request from {}", peer);
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

async fn handle_socket(socket: WebSocket, state: RelayState, peer: SocketAddr) {
    // Subscribe first so nothing published during setup is missed.
    let subscription = state.inbound.subscribe();
    let (sender, receiver) = socket.split();
    let sink = sender
        .with(|line: String| future::ready(Ok::<_, axum::Error>(Message::Text(line.into()))));

    if let Err(e) = state
        .connector
        .handle(sink, text_frames(receiver), subscription, Some(peer.to_string()))
        .await
    {
        error!("Connection from {} closed with error: {}", peer, e);
    }
}

/// Text payloads of incoming frames, ending at close or on a socket error.
fn text_frames(receiver: SplitStream<WebSocket>) -> impl Stream<Item = String> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.next().await? {
                Ok(Message::Text(text)) => return Some((text.to_string(), receiver)),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some((text, receiver)),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    return None;
                }
            }
        }
    })
}

/// Serve downstream connections on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// A bound relay: listener plus router state.
pub struct Relay {
    listener: TcpListener,
    state: RelayState,
}

impl Relay {
    pub async fn bind<A: ToSocketAddrs>(addr: A, sink: Arc<dyn LineSink>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let state = RelayState::new(Connector::new(sink));
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn id(&self) -> &str {
        self.state.connector.id()
    }

    /// Ingest `upstream` and serve downstream connections.
    ///
    /// Returns when the upstream reaches EOF or `shutdown` resolves. An
    /// undecodable upstream line is reported as an `error` line and returned.
    pub async fn run<R, F>(self, upstream: R, shutdown: F) -> Result<()>
    where
        R: AsyncRead + Unpin,
        F: Future<Output = ()>,
    {
        let Relay { listener, state } = self;
        let addr = listener.local_addr()?;
        info!("Relay {} listening on ws://{}", state.connector.id(), addr);

        let stop_server = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            state.clone(),
            stop_server.clone().cancelled_owned(),
        ));

        let result = tokio::select! {
            result = state.connector.gather(upstream, &state.inbound) => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        if let Err(e) = &result
            && let Err(write_err) = state
                .connector
                .output()
                .error(format!("Server: parse stdout: {e}"))
        {
            warn!("Failed to report ingestion error: {}", write_err);
        }

        state.inbound.close();
        stop_server.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Server stopped with error: {}", e),
            Err(e) => warn!("Server task failed: {}", e),
        }
        info!("Relay {} stopped", state.connector.id());

        result
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ChannelSink;

    #[tokio::test]
    async fn test_health_reports_router() {
        let (sink, _rx) = ChannelSink::new();
        let state = RelayState::new(Connector::with_id("r1", Arc::new(sink)));
        state.connector.attach(None);

        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.id, "r1");
        assert_eq!(body.connections, 1);
    }

    #[tokio::test]
    async fn test_run_ends_at_upstream_eof() {
        let (sink, _rx) = ChannelSink::new();
        let relay = Relay::bind("127.0.0.1:0", Arc::new(sink)).await.unwrap();
        let inbound = relay.state().inbound.clone();

        relay.run(tokio::io::empty(), future::pending()).await.unwrap();
        assert!(inbound.is_closed());
    }

    #[tokio::test]
    async fn test_run_reports_bad_upstream_line() {
        let (sink, mut rx) = ChannelSink::new();
        let relay = Relay::bind("127.0.0.1:0", Arc::new(sink)).await.unwrap();
        let id = relay.id().to_string();

        let result = relay.run("garbage\n".as_bytes(), future::pending()).await;
        assert!(result.unwrap_err().is_decode());

        let mut errors = Vec::new();
        while let Ok((_, line)) = rx.try_recv() {
            let envelope = Envelope::from_line(&line).unwrap();
            if envelope.lane == relayline_protocol::Lane::Error {
                errors.push(envelope);
            }
        }
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id, id);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (sink, _rx) = ChannelSink::new();
        let relay = Relay::bind("127.0.0.1:0", Arc::new(sink)).await.unwrap();
        let (_keep_open, upstream) = tokio::io::duplex(64);

        relay.run(upstream, future::ready(())).await.unwrap();
    }
}
