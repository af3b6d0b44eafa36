//! In-process stand-ins for the gateway socket and the HTTP transport.

use crate::error::{Error, ErrorKind};
use crate::handler::EventHandler;
use crate::payload::GatewayEvent;
use crate::shard::ShardState;
use crate::socket::{GatewayConnector, GatewaySocket, SocketMessage};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// A frame written by the client
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ClientFrame {
    Text(String),
    Close(u16),
}

/// Server half of one mock connection
pub(crate) struct MockServer {
    pub url: String,
    to_client: mpsc::UnboundedSender<SocketMessage>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
}

impl MockServer {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(SocketMessage::Text(value.to_string()));
    }

    pub fn hello(&self, heartbeat_interval: u64) {
        self.send_json(json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval}}));
    }

    pub fn dispatch(&self, name: &str, seq: u64, d: Value) {
        self.send_json(json!({"op": 0, "t": name, "s": seq, "d": d}));
    }

    pub fn ready(&self, session_id: &str, seq: u64) {
        self.dispatch(
            "READY",
            seq,
            json!({"session_id": session_id, "resume_gateway_url": "wss://resume.test"}),
        );
    }

    pub fn heartbeat_ack(&self) {
        self.send_json(json!({"op": 11}));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(SocketMessage::Close(Some(code)));
    }

    /// Next frame from the client; `None` once the client dropped the socket
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    /// Next text frame decoded as JSON. Panics on a close frame.
    pub async fn recv_json(&mut self) -> Value {
        match self.recv().await {
            Some(ClientFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// Skip heartbeats until a frame with op `op` arrives
    pub async fn recv_op(&mut self, op: u64) -> Value {
        loop {
            let value = self.recv_json().await;
            if value["op"] == op {
                return value;
            }
        }
    }
}

pub(crate) struct MockSocket {
    incoming: mpsc::UnboundedReceiver<SocketMessage>,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
}

impl GatewaySocket for MockSocket {
    async fn send(&mut self, text: String) -> Result<(), Error> {
        self.outgoing
            .send(ClientFrame::Text(text))
            .map_err(|_| Error::Transport("mock server gone".into()))
    }

    async fn next_message(&mut self) -> Option<Result<SocketMessage, Error>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16) -> Result<(), Error> {
        let _ = self.outgoing.send(ClientFrame::Close(code));
        Ok(())
    }
}

/// Hands the server half of every connection to the test
pub(crate) struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    /// Number of upcoming connects that fail
    failures: Mutex<u32>,
    attempts: Mutex<Vec<Instant>>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Self {
                servers,
                failures: Mutex::new(0),
                attempts: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    /// When each connect was attempted, failed ones included
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }
}

impl GatewayConnector for MockConnector {
    type Socket = MockSocket;

    async fn connect(&self, url: &str) -> Result<MockSocket, Error> {
        self.attempts.lock().push(Instant::now());
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Transport("connection refused".into()));
            }
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let server = MockServer {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.servers
            .send(server)
            .map_err(|_| Error::Transport("test dropped the server receiver".into()))?;
        Ok(MockSocket { incoming, outgoing })
    }
}

type Responder = dyn Fn(&HttpRequest, usize) -> Result<HttpResponse, Error> + Send + Sync;

/// HTTP transport answering from a closure and recording every request
pub(crate) struct MockTransport {
    responder: Box<Responder>,
    requests: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl MockTransport {
    /// `responder` gets the request and its zero-based index
    pub fn new(
        responder: impl Fn(&HttpRequest, usize) -> Result<HttpResponse, Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer with `responses` in order, then with empty 200s
    pub fn scripted(responses: Vec<Result<HttpResponse, Error>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_, _| queue.lock().pop_front().unwrap_or_else(|| Ok(response(200, &[], "{}"))))
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().iter().map(|(t, _)| *t).collect()
    }
}

impl HttpTransport for Arc<MockTransport> {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        let index = {
            let mut requests = self.requests.lock();
            requests.push((Instant::now(), request.clone()));
            requests.len() - 1
        };
        // Yield so concurrent callers interleave like a real network
        tokio::task::yield_now().await;
        (self.responder)(&request, index)
    }
}

pub(crate) fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    HttpResponse {
        status,
        headers: map,
        body: body.as_bytes().to_vec(),
    }
}

/// Everything a [`RecordingHandler`] saw
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Record {
    Event(u32, String),
    State(u32, ShardState, ShardState),
    Error(u32, ErrorKind),
}

/// Handler that forwards every callback to a channel
pub(crate) struct RecordingHandler {
    tx: mpsc::UnboundedSender<Record>,
}

impl RecordingHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Record>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for RecordingHandler {
    async fn on_event(&self, shard_id: u32, event: GatewayEvent) {
        let _ = self.tx.send(Record::Event(shard_id, event.name));
    }

    async fn on_state_change(&self, shard_id: u32, from: ShardState, to: ShardState) {
        let _ = self.tx.send(Record::State(shard_id, from, to));
    }

    async fn on_error(&self, shard_id: u32, kind: ErrorKind, _message: &str) {
        let _ = self.tx.send(Record::Error(shard_id, kind));
    }
}

/// Receive records until `shard_id` reaches `state`, returning the states
/// it passed through on the way.
pub(crate) async fn wait_for_state(
    records: &mut mpsc::UnboundedReceiver<Record>,
    shard_id: u32,
    state: ShardState,
) -> Vec<ShardState> {
    let mut seen = Vec::new();
    while let Some(record) = records.recv().await {
        if let Record::State(id, _, to) = record {
            if id == shard_id {
                seen.push(to);
                if to == state {
                    return seen;
                }
            }
        }
    }
    panic!("handler channel closed before shard {} reached {}", shard_id, state);
}
