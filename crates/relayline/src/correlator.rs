//! Request/response correlation over a shared duplex stream.
//!
//! A [`Correlator`] turns "send one command, receive a stream of responses"
//! into a single call. Each request gets the next `seq`; a background scan
//! watches the shared inbound stream for envelopes with the request's `id`
//! and `seq` and hands them to the caller until one arrives without
//! `next: true`.
//!
//! The scan reads its own [`Subscription`], so envelopes it ignores remain
//! visible to every other correlator and to the router reading the same
//! stream. A scan never misses an envelope, however far behind it runs or
//! however slowly the caller reads. Once started, a scan runs until its exchange ends or the stream is
//! closed, even if the caller stops reading. There are no timeouts here;
//! wrap [`Correlator::submit`] if an exchange may never finish.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::Stream;
use log::{debug, error, warn};
use relayline_protocol::{CommandPayload, Envelope, Payload};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use crate::chan::{ChanReceiver, ChanSender, SharedStream, Subscription, chan};
use crate::error::{RelayError, Result};

/// Default capacity of a response sequence (a near-rendezvous hand-off).
pub const DEFAULT_RESPONSE_CAPACITY: usize = 1;

// ============================================================================
// Transport
// ============================================================================

/// One-shot send primitive of a duplex channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand over one envelope. `false` means it was not accepted
    /// (closed or backpressured) and will never be delivered.
    async fn post(&self, envelope: &Envelope) -> bool;
}

/// In-process transport backed by a bounded queue. Never waits: a full or
/// closed queue rejects the envelope.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn post(&self, envelope: &Envelope) -> bool {
        self.tx.try_send(envelope.clone()).is_ok()
    }
}

/// Writes each envelope as one JSON line, e.g. into a relay's stdin.
pub struct LineTransport<W> {
    writer: Mutex<W>,
}

impl<W> LineTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for LineTransport<W> {
    async fn post(&self, envelope: &Envelope) -> bool {
        let mut line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize envelope for {}: {}", envelope.id, e);
                return false;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Failed to write envelope line: {}", e);
            return false;
        }
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush envelope line: {}", e);
            return false;
        }
        true
    }
}

// ============================================================================
// Correlator
// ============================================================================

pub struct Correlator<T> {
    transport: T,
    inbound: SharedStream<Envelope>,
    seq: AtomicU64,
    response_capacity: usize,
}

impl<T: Transport> Correlator<T> {
    pub fn new(transport: T, inbound: SharedStream<Envelope>) -> Self {
        Self {
            transport,
            inbound,
            seq: AtomicU64::new(0),
            response_capacity: DEFAULT_RESPONSE_CAPACITY,
        }
    }

    pub fn with_response_capacity(mut self, capacity: usize) -> Self {
        self.response_capacity = capacity;
        self
    }

    /// The shared inbound stream scanned for responses.
    pub fn inbound(&self) -> &SharedStream<Envelope> {
        &self.inbound
    }

    /// Feed one inbound envelope to every active scan.
    pub fn handle_message(&self, envelope: Envelope) -> usize {
        self.inbound.publish(envelope)
    }

    /// Send `request` with the next `seq` and return its response sequence.
    ///
    /// The request payload must be a JSON object, or a string holding one; it
    /// is sent as a JSON string with `seq` added. Fails with
    /// [`RelayError::DeliveryFailed`] when the transport rejects it, in which
    /// case nothing is scanned for.
    pub async fn submit(&self, request: &Envelope) -> Result<ResponseStream> {
        let fields = request_fields(&request.payload)?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let encoded = CommandPayload::encode(&fields, seq).map_err(RelayError::Encode)?;
        let envelope = Envelope::new(request.id.as_str(), request.lane, Payload::Text(encoded));

        // Subscribe before posting so a fast response cannot slip past.
        let subscription = self.inbound.subscribe();

        if !self.transport.post(&envelope).await {
            error!(
                "Failed to post {} for {} (seq {})",
                request.lane, request.id, seq
            );
            return Err(RelayError::DeliveryFailed {
                id: request.id.clone(),
                seq,
            });
        }

        let (tx, rx) = chan(self.response_capacity);
        tokio::spawn(scan(request.id.clone(), seq, subscription, tx));

        Ok(ResponseStream { seq, rx })
    }

    /// Submit and wait for the whole response sequence.
    pub async fn submit_and_collect(&self, request: &Envelope) -> Result<Vec<CommandPayload>> {
        let mut responses = self.submit(request).await?;
        let mut collected = Vec::new();
        while let Some(response) = responses.recv().await {
            collected.push(response);
        }
        Ok(collected)
    }
}

fn request_fields(payload: &Payload) -> Result<Map<String, Value>> {
    match payload {
        Payload::Object(map) => Ok(map.clone()),
        Payload::Text(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(RelayError::InvalidRequest(
                "payload must be a JSON object".to_string(),
            )),
            Err(e) => Err(RelayError::InvalidRequest(format!(
                "payload is not JSON: {e}"
            ))),
        },
    }
}

/// Background scan for one `(id, seq)` exchange.
async fn scan(
    id: String,
    seq: u64,
    mut subscription: Subscription<Envelope>,
    responses: ChanSender<CommandPayload>,
) {
    while let Some(envelope) = subscription.recv().await {
        if envelope.id != id {
            continue;
        }
        let payload = match CommandPayload::decode(&envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Dropping undecodable {} for {}: {}", envelope.lane, id, e);
                continue;
            }
        };
        if payload.seq != seq {
            continue;
        }

        let last = payload.is_final();
        if responses.send(payload).await.is_err() {
            debug!("Response for {} seq {} has no reader", id, seq);
        }
        if last {
            break;
        }
    }
    responses.close();
}

/// Responses to one submitted request, in arrival order.
pub struct ResponseStream {
    seq: u64,
    rx: ChanReceiver<CommandPayload>,
}

impl ResponseStream {
    /// The `seq` assigned to the request.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Next response; `None` after the final one or when the stream closed.
    pub async fn recv(&mut self) -> Option<CommandPayload> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = CommandPayload> {
        self.rx.into_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use relayline_protocol::Lane;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn object(value: Value) -> Payload {
        Payload::from_value(value).unwrap()
    }

    fn reply(id: &str, value: Value) -> Envelope {
        Envelope::command(id, Payload::Text(value.to_string()))
    }

    fn setup() -> (Correlator<ChannelTransport>, mpsc::Receiver<Envelope>) {
        let (transport, posted) = ChannelTransport::new(8);
        (Correlator::new(transport, SharedStream::new()), posted)
    }

    async fn wait_for_subscribers(shared: &SharedStream<Envelope>, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while shared.subscriber_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    #[tokio::test]
    async fn test_posted_request_carries_seq() {
        let (correlator, mut posted) = setup();
        let request = Envelope::command("test-1", object(json!({ "test": 0 })));
        let _responses = correlator.submit(&request).await.unwrap();

        let sent = posted.recv().await.unwrap();
        assert_eq!(sent.id, "test-1");
        assert_eq!(sent.lane, Lane::Command);
        let text = sent.payload.as_text().expect("payload is sent as a JSON string");
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(value, json!({ "test": 0, "seq": 0 }));
    }

    #[tokio::test]
    async fn test_seq_increments_per_request() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("c", object(json!({})));
        for expected in 0..3 {
            let responses = correlator.submit(&request).await.unwrap();
            assert_eq!(responses.seq(), expected);
        }
    }

    #[tokio::test]
    async fn test_interleaved_responses_are_demultiplexed() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("c1", object(json!({ "command": "pick" })));
        let responses = correlator.submit(&request).await.unwrap();

        correlator.handle_message(reply("c2", json!({ "seq": 0 })));
        correlator.handle_message(reply("c1", json!({ "seq": 0, "next": true, "v": 1 })));
        correlator.handle_message(reply("c1", json!({ "seq": 0, "v": 2 })));
        correlator.handle_message(reply("c1", json!({ "seq": 0, "v": 3 })));

        let got: Vec<_> = responses.into_stream().collect().await;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].next, Some(true));
        assert_eq!(got[0].get("v"), Some(&json!(1)));
        assert_eq!(got[1].next, None);
        assert_eq!(got[1].get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_released_only_by_matching_seq() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("test-1", object(json!({ "test": 0 })));
        let mut responses = correlator.submit(&request).await.unwrap();

        correlator.handle_message(reply("another-id", json!({ "seq": 0 })));
        correlator.handle_message(reply("test-1", json!({ "seq": 1 })));
        correlator.handle_message(reply("test-1", json!({ "seq": 0, "done": true })));

        let only = responses.recv().await.unwrap();
        assert_eq!(only.get("done"), Some(&json!(true)));
        assert!(responses.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_multiple_responses_until_final() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("test-1", object(json!({ "test": 0 })));
        let responses = correlator.submit(&request).await.unwrap();

        correlator.handle_message(reply("another-id", json!({ "seq": 0 })));
        correlator.handle_message(reply("test-1", json!({ "seq": 0, "next": true })));
        correlator.handle_message(reply("test-1", json!({ "seq": 0, "next": true })));
        correlator.handle_message(reply("test-1", json!({ "seq": 1 })));
        correlator.handle_message(reply("test-1", json!({ "seq": 0 })));

        assert_eq!(responses.into_stream().count().await, 3);
    }

    #[tokio::test]
    async fn test_late_reader_gets_every_response() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("c1", object(json!({})));
        let mut responses = correlator.submit(&request).await.unwrap();

        for v in 0..3 {
            correlator.handle_message(reply("c1", json!({ "seq": 0, "next": true, "v": v })));
        }
        correlator.handle_message(reply("c1", json!({ "seq": 0, "v": 3 })));
        for n in 0..300 {
            correlator.handle_message(Envelope::term("host", Payload::from(format!("out {n}"))));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut values = Vec::new();
        while let Some(response) = tokio::time::timeout(Duration::from_secs(1), responses.recv())
            .await
            .expect("response sequence never closed")
        {
            values.push(response.get("v").cloned().unwrap());
        }
        assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_object_payload_responses_match() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("c1", object(json!({})));
        let responses = correlator.submit(&request).await.unwrap();

        correlator.handle_message(Envelope::command("c1", object(json!({ "seq": 0, "ok": 1 }))));

        let got: Vec<_> = responses.into_stream().collect().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("ok"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_concurrent_correlations_share_the_stream() {
        let (correlator, _posted) = setup();
        let first = correlator
            .submit(&Envelope::command("c1", object(json!({ "n": "a" }))))
            .await
            .unwrap();
        let second = correlator
            .submit(&Envelope::command("c1", object(json!({ "n": "b" }))))
            .await
            .unwrap();
        assert_eq!((first.seq(), second.seq()), (0, 1));

        correlator.handle_message(reply("c1", json!({ "seq": 1, "next": true, "v": "b1" })));
        correlator.handle_message(reply("c1", json!({ "seq": 0, "v": "a1" })));
        correlator.handle_message(reply("c1", json!({ "seq": 1, "v": "b2" })));

        let (a, b) = tokio::join!(
            first.into_stream().collect::<Vec<_>>(),
            second.into_stream().collect::<Vec<_>>()
        );
        let values = |items: &[CommandPayload]| -> Vec<Value> {
            items.iter().filter_map(|p| p.get("v").cloned()).collect()
        };
        assert_eq!(values(&a), vec![json!("a1")]);
        assert_eq!(values(&b), vec![json!("b1"), json!("b2")]);
    }

    #[tokio::test]
    async fn test_malformed_matching_envelope_is_dropped() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("c1", object(json!({})));
        let responses = correlator.submit(&request).await.unwrap();

        correlator.handle_message(Envelope::command("c1", "{not json"));
        correlator.handle_message(Envelope::log("c1", "plain log line"));
        correlator.handle_message(reply("c1", json!({ "seq": 0, "ok": true })));

        let got: Vec<_> = responses.into_stream().collect().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("ok"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_delivery_failure_returns_no_sequence() {
        let (transport, posted) = ChannelTransport::new(1);
        drop(posted);
        let correlator = Correlator::new(transport, SharedStream::new());
        let request = Envelope::command("c1", object(json!({})));

        let result = correlator.submit(&request).await;
        assert!(matches!(
            result,
            Err(RelayError::DeliveryFailed { ref id, seq: 0 }) if id == "c1"
        ));
        assert_eq!(correlator.inbound().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_is_a_delivery_failure() {
        let (transport, _posted) = ChannelTransport::new(1);
        let correlator = Correlator::new(transport, SharedStream::new());
        let request = Envelope::command("c1", object(json!({})));

        assert!(correlator.submit(&request).await.is_ok());
        assert!(matches!(
            correlator.submit(&request).await,
            Err(RelayError::DeliveryFailed { seq: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_request_payload() {
        let (correlator, _posted) = setup();
        let not_json = Envelope::command("c1", "plain text");
        assert!(matches!(
            correlator.submit(&not_json).await,
            Err(RelayError::InvalidRequest(_))
        ));
        let not_object = Envelope::command("c1", "[1,2]");
        assert!(matches!(
            correlator.submit(&not_object).await,
            Err(RelayError::InvalidRequest(_))
        ));
        // Text holding an object is accepted.
        let text_object = Envelope::command("c1", r#"{"command":"setup"}"#);
        assert!(correlator.submit(&text_object).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_scan_runs_until_final() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("c1", object(json!({})));
        let responses = correlator.submit(&request).await.unwrap();
        drop(responses);

        correlator.handle_message(reply("c1", json!({ "seq": 0, "next": true })));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(correlator.inbound().subscriber_count(), 1);

        correlator.handle_message(reply("c1", json!({ "seq": 0 })));
        wait_for_subscribers(correlator.inbound(), 0).await;
    }

    #[tokio::test]
    async fn test_closing_the_stream_ends_the_sequence() {
        let (correlator, _posted) = setup();
        let request = Envelope::command("c1", object(json!({})));
        let mut responses = correlator.submit(&request).await.unwrap();

        correlator.handle_message(reply("c1", json!({ "seq": 0, "next": true })));
        assert!(responses.recv().await.is_some());

        correlator.inbound().close();
        let end = tokio::time::timeout(Duration::from_secs(1), responses.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_submit_and_collect() {
        let (transport, mut posted) = ChannelTransport::new(8);
        let correlator =
            Arc::new(Correlator::new(transport, SharedStream::new()).with_response_capacity(4));

        let executor = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                let request = posted.recv().await.unwrap();
                let payload = CommandPayload::decode(&request.payload).unwrap();
                for part in ["a", "b"] {
                    let mut fields = Map::new();
                    fields.insert("part".to_string(), json!(part));
                    let mut response = CommandPayload::new(payload.seq, fields);
                    if part == "a" {
                        response = response.with_next();
                    }
                    correlator.handle_message(Envelope::command(
                        request.id.as_str(),
                        response.to_payload().unwrap(),
                    ));
                }
            })
        };

        let request = Envelope::command("c1", object(json!({ "command": "pickAllFiles" })));
        let collected = correlator.submit_and_collect(&request).await.unwrap();
        executor.await.unwrap();

        let parts: Vec<_> = collected.iter().map(|p| p.get("part").cloned()).collect();
        assert_eq!(parts, vec![Some(json!("a")), Some(json!("b"))]);
    }

    #[tokio::test]
    async fn test_line_transport_writes_one_line() {
        use tokio::io::AsyncBufReadExt;

        let (writer, reader) = tokio::io::duplex(1024);
        let transport = LineTransport::new(writer);
        assert!(transport.post(&Envelope::log("r1", "hello")).await);

        let mut lines = tokio::io::BufReader::new(reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(Envelope::from_line(&line).unwrap(), Envelope::log("r1", "hello"));
    }

    #[tokio::test]
    async fn test_line_transport_reports_closed_pipe() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);
        let transport = LineTransport::new(writer);
        assert!(!transport.post(&Envelope::log("r1", "lost")).await);
    }
}
