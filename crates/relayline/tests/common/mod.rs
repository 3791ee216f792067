//! Test utilities: an in-process relay with a host on its upstream side.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relayline::protocol::Envelope;
use relayline::{
    ChannelSink, Correlator, DownstreamClient, LineTransport, Relay, RelayState, Result,
    SharedStream, SinkTarget,
};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type HostCorrelator = Correlator<LineTransport<DuplexStream>>;

/// A running relay, driven over an in-memory upstream pipe.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub id: String,
    pub state: RelayState,
    /// Host-side correlator writing into the relay's upstream pipe.
    pub host: Arc<HostCorrelator>,
    /// Every line the relay wrote upstream, in order.
    pub upstream_lines: mpsc::UnboundedReceiver<(SinkTarget, Envelope)>,
    pub task: JoinHandle<Result<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let (sink, mut raw_lines) = ChannelSink::new();
        let relay = Relay::bind("127.0.0.1:0", Arc::new(sink))
            .await
            .expect("bind relay");
        let addr = relay.local_addr().expect("local addr");
        let id = relay.id().to_string();
        let state = relay.state().clone();

        let (host_end, relay_end) = tokio::io::duplex(64 * 1024);
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(relay.run(relay_end, async move {
            let _ = stopped.await;
        }));

        let host = Arc::new(Correlator::new(
            LineTransport::new(host_end),
            SharedStream::new(),
        ));

        // Host side of the relay's stdout: correlate relayed lanes, keep a copy of everything.
        let (lines_tx, upstream_lines) = mpsc::unbounded_channel();
        let pump_host = Arc::clone(&host);
        tokio::spawn(async move {
            while let Some((target, line)) = raw_lines.recv().await {
                let envelope = Envelope::from_line(&line).expect("relay wrote invalid JSON");
                if envelope.lane.is_relayed() {
                    pump_host.handle_message(envelope.clone());
                }
                if lines_tx.send((target, envelope)).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            id,
            state,
            host,
            upstream_lines,
            task,
            stop: Some(stop),
        }
    }

    /// Trigger the relay's shutdown path.
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connect an executor and wait until the relay has registered it.
    pub async fn connect(&self) -> DownstreamClient {
        let expected = self.state.connector.connection_count() + 1;
        let client = DownstreamClient::connect(&self.url())
            .await
            .expect("connect executor");
        self.wait_for_connections(expected).await;
        client
    }

    pub async fn wait_for_connections(&self, expected: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while self.state.connector.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection count never settled");
    }

    /// Next line the relay wrote upstream.
    pub async fn next_line(&mut self) -> (SinkTarget, Envelope) {
        tokio::time::timeout(TIMEOUT, self.upstream_lines.recv())
            .await
            .expect("timed out waiting for an upstream line")
            .expect("upstream line channel closed")
    }
}

pub async fn recv_envelope(client: &mut DownstreamClient) -> Envelope {
    tokio::time::timeout(TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for a relayed envelope")
        .expect("relay closed the connection")
}
