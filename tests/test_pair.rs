//! Tests for the stream pair transaction loop

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use httpstitch::http::event::{Event, EventKind, HeaderItem};
use httpstitch::http::parser::{BodyOrigin, ParseError, RequestLine, StatusLine};
use httpstitch::stream::{CloseReason, HalfStream, PairError, StreamError, StreamKey, StreamPair};
use tokio::sync::{mpsc, watch};

/// One scripted result for the next read call.
enum Step {
    Request(&'static str, &'static str),
    Status(u16, &'static str),
    Headers(Vec<(&'static str, &'static str)>),
    Body(&'static [u8]),
    Fail(StreamError),
    /// Never completes
    Hang,
}

/// Half-stream that replays a fixed script and counts cancellations.
struct ScriptedStream {
    key: StreamKey,
    steps: VecDeque<Step>,
    clock: SystemTime,
    cancels: Arc<AtomicUsize>,
    body_calls: Arc<Mutex<Vec<(String, BodyOrigin)>>>,
}

impl ScriptedStream {
    fn new(key: StreamKey, steps: Vec<Step>) -> Self {
        Self {
            key,
            steps: steps.into(),
            clock: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000),
            cancels: Arc::new(AtomicUsize::new(0)),
            body_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn next(&mut self) -> Result<Step, StreamError> {
        self.clock += Duration::from_millis(1);
        match self.steps.pop_front() {
            None => Err(StreamError::Closed),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Hang) => std::future::pending().await,
            Some(step) => Ok(step),
        }
    }
}

impl HalfStream for ScriptedStream {
    fn key(&self) -> StreamKey {
        self.key
    }

    fn last_seen(&self) -> SystemTime {
        self.clock
    }

    async fn read_request_line(&mut self) -> Result<RequestLine, StreamError> {
        match self.next().await? {
            Step::Request(method, target) => Ok(RequestLine {
                method: method.to_string(),
                target: target.into(),
                version: "HTTP/1.1".to_string(),
            }),
            _ => panic!("script expected a request line"),
        }
    }

    async fn read_response_line(&mut self) -> Result<StatusLine, StreamError> {
        match self.next().await? {
            Step::Status(code, reason) => Ok(StatusLine {
                version: "HTTP/1.1".to_string(),
                code,
                reason: reason.into(),
            }),
            _ => panic!("script expected a status line"),
        }
    }

    async fn read_headers(&mut self) -> Result<Vec<HeaderItem>, StreamError> {
        match self.next().await? {
            Step::Headers(headers) => Ok(headers
                .into_iter()
                .map(|(name, value)| HeaderItem::new(name, value))
                .collect()),
            _ => panic!("script expected headers"),
        }
    }

    async fn read_body(
        &mut self,
        method: &str,
        _headers: &[HeaderItem],
        origin: BodyOrigin,
    ) -> Result<Vec<u8>, StreamError> {
        self.body_calls.lock().unwrap().push((method.to_string(), origin));
        match self.next().await? {
            Step::Body(body) => Ok(body.to_vec()),
            _ => panic!("script expected a body"),
        }
    }

    fn cancel(&mut self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

fn upstream_key() -> StreamKey {
    let client: SocketAddr = "10.1.1.1:50000".parse().unwrap();
    let server: SocketAddr = "10.1.1.2:8080".parse().unwrap();
    StreamKey::new(client, server)
}

/// Request/response script for `n` simple GET transactions.
fn get_transactions(n: usize) -> (Vec<Step>, Vec<Step>) {
    let mut up = Vec::new();
    let mut down = Vec::new();
    for _ in 0..n {
        up.push(Step::Request("GET", "/"));
        up.push(Step::Headers(vec![("Host", "x")]));
        up.push(Step::Body(b""));
        down.push(Step::Status(200, "OK"));
        down.push(Step::Headers(vec![("Content-Length", "2")]));
        down.push(Step::Body(b"ok"));
    }
    (up, down)
}

struct Harness {
    pair: StreamPair<ScriptedStream>,
    up_cancels: Arc<AtomicUsize>,
    down_cancels: Arc<AtomicUsize>,
    up_bodies: Arc<Mutex<Vec<(String, BodyOrigin)>>>,
    down_bodies: Arc<Mutex<Vec<(String, BodyOrigin)>>>,
}

fn harness(conn_seq: u64, events: mpsc::Sender<Event>, up: Vec<Step>, down: Vec<Step>) -> Harness {
    let upstream = ScriptedStream::new(upstream_key(), up);
    let downstream = ScriptedStream::new(upstream_key().reverse(), down);
    let up_cancels = upstream.cancels.clone();
    let down_cancels = downstream.cancels.clone();
    let up_bodies = upstream.body_calls.clone();
    let down_bodies = downstream.body_calls.clone();

    let mut pair = StreamPair::new(conn_seq, events);
    assert!(pair.attach_upstream(upstream).is_ok());
    assert!(pair.attach_downstream(downstream).is_ok());

    Harness {
        pair,
        up_cancels,
        down_cancels,
        up_bodies,
        down_bodies,
    }
}

async fn collect(mut rx: mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_single_transaction_events() {
    let (tx, rx) = mpsc::channel(16);
    let up = vec![
        Step::Request("GET", "/a"),
        Step::Headers(vec![("Host", "x")]),
        Step::Body(b""),
    ];
    let down = vec![
        Step::Status(200, "OK"),
        Step::Headers(vec![("Content-Length", "5")]),
        Step::Body(b"hello"),
    ];
    let h = harness(1, tx, up, down);

    let summary = h.pair.run().await;
    let events = collect(rx).await;

    assert_eq!(events.len(), 2);
    let Event::Request(req) = &events[0] else {
        panic!("first event should be the request");
    };
    assert_eq!(req.method, "GET");
    assert_eq!(req.uri, "/a");
    assert_eq!(req.version, "HTTP/1.1");
    assert_eq!(req.headers, vec![HeaderItem::new("Host", "x")]);
    assert!(req.body.is_empty());
    assert_eq!(req.endpoints.client.to_string(), "10.1.1.1:50000");
    assert_eq!(req.endpoints.server.to_string(), "10.1.1.2:8080");

    let Event::Response(resp) = &events[1] else {
        panic!("second event should be the response");
    };
    assert_eq!(resp.version, "HTTP/1.1");
    assert_eq!(resp.code, 200);
    assert_eq!(resp.reason, "OK");
    assert_eq!(resp.headers, vec![HeaderItem::new("Content-Length", "5")]);
    assert_eq!(resp.body, b"hello".to_vec());
    // Response addresses follow the connection, not the downstream key
    assert_eq!(resp.endpoints, req.endpoints);

    // The loop went on to try a second transaction and found the stream closed
    assert_eq!(summary.transactions, 1);
    assert!(matches!(summary.close, CloseReason::StreamEnded));
    assert_eq!(h.up_cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.down_cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_events_alternate_and_carry_conn_seq() {
    let (tx, rx) = mpsc::channel(64);
    let (up, down) = get_transactions(3);
    let h = harness(42, tx, up, down);
    assert_eq!(h.pair.conn_seq(), 42);

    let summary = h.pair.run().await;
    let events = collect(rx).await;

    assert_eq!(summary.conn_seq, 42);
    assert_eq!(summary.transactions, 3);
    assert_eq!(events.len(), 6);

    for (i, event) in events.iter().enumerate() {
        let expected = if i % 2 == 0 { EventKind::Request } else { EventKind::Response };
        assert_eq!(event.kind(), expected);
        assert_eq!(event.stream_seq(), 42);
        assert!(event.envelope().start() <= event.envelope().end());
    }
}

#[tokio::test]
async fn test_timestamps_come_from_stream_clock() {
    let (tx, rx) = mpsc::channel(16);
    let (up, down) = get_transactions(1);
    let h = harness(0, tx, up, down);

    h.pair.run().await;
    let events = collect(rx).await;

    // Start is taken after the start line, end after the body
    let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
    let request = events[0].envelope();
    assert_eq!(request.start(), base + Duration::from_millis(1));
    assert_eq!(request.end(), base + Duration::from_millis(3));
}

#[tokio::test]
async fn test_headers_preserve_order_and_duplicates() {
    let (tx, rx) = mpsc::channel(16);
    let up = vec![
        Step::Request("GET", "/"),
        Step::Headers(vec![("Accept", "a"), ("X-Dup", "1"), ("Accept", "b"), ("X-Dup", "2")]),
        Step::Body(b""),
    ];
    let down = vec![
        Step::Status(200, "OK"),
        Step::Headers(vec![("Set-Cookie", "a=1"), ("Set-Cookie", "b=2")]),
        Step::Body(b""),
    ];
    let h = harness(0, tx, up, down);

    h.pair.run().await;
    let events = collect(rx).await;

    let Event::Request(req) = &events[0] else { panic!() };
    let names: Vec<(&str, &[u8])> = req.headers.iter().map(|h| (h.name.as_str(), h.value.as_ref())).collect();
    assert_eq!(names, vec![("Accept", &b"a"[..]), ("X-Dup", &b"1"[..]), ("Accept", &b"b"[..]), ("X-Dup", &b"2"[..])]);

    let Event::Response(resp) = &events[1] else { panic!() };
    assert_eq!(resp.headers.len(), 2);
    assert_eq!(resp.headers[1].value, "b=2");
}

#[tokio::test]
async fn test_body_passthrough_is_verbatim() {
    let (tx, rx) = mpsc::channel(16);
    let up = vec![
        Step::Request("POST", "/upload"),
        Step::Headers(vec![("Content-Length", "4")]),
        Step::Body(b"\x00\xff\r\n"),
    ];
    let down = vec![
        Step::Status(201, "Created"),
        Step::Headers(vec![]),
        Step::Body(b"\x1f\x8b\x08"),
    ];
    let h = harness(0, tx, up, down);

    h.pair.run().await;
    let events = collect(rx).await;

    let Event::Request(req) = &events[0] else { panic!() };
    assert_eq!(req.body, b"\x00\xff\r\n".to_vec());
    let Event::Response(resp) = &events[1] else { panic!() };
    assert_eq!(resp.body, b"\x1f\x8b\x08".to_vec());
}

#[tokio::test]
async fn test_body_reads_get_method_and_origin() {
    let (tx, rx) = mpsc::channel(16);
    let up = vec![
        Step::Request("HEAD", "/"),
        Step::Headers(vec![]),
        Step::Body(b""),
    ];
    let down = vec![
        Step::Status(304, "Not Modified"),
        Step::Headers(vec![]),
        Step::Body(b""),
    ];
    let h = harness(0, tx, up, down);

    h.pair.run().await;
    drop(rx);

    assert_eq!(
        *h.up_bodies.lock().unwrap(),
        vec![("HEAD".to_string(), BodyOrigin::Request)]
    );
    // Response framing is decided with the request's method
    assert_eq!(
        *h.down_bodies.lock().unwrap(),
        vec![("HEAD".to_string(), BodyOrigin::Response(304))]
    );
}

#[tokio::test]
async fn test_failure_in_headers_emits_nothing() {
    let (tx, rx) = mpsc::channel(16);
    let up = vec![Step::Request("GET", "/"), Step::Fail(StreamError::UnexpectedEof)];
    let h = harness(5, tx, up, vec![]);

    let summary = h.pair.run().await;
    let events = collect(rx).await;

    assert!(events.is_empty());
    assert_eq!(summary.transactions, 0);
    assert!(matches!(
        summary.close,
        CloseReason::Failed(PairError::Upstream(StreamError::UnexpectedEof))
    ));
    assert_eq!(h.up_cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.down_cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_in_body_keeps_earlier_transactions() {
    let (tx, rx) = mpsc::channel(16);
    let (mut up, down) = get_transactions(1);
    up.push(Step::Request("POST", "/broken"));
    up.push(Step::Headers(vec![("Content-Length", "abc")]));
    up.push(Step::Fail(StreamError::Parse(ParseError::InvalidContentLength("abc".to_string()))));
    let h = harness(8, tx, up, down);

    let summary = h.pair.run().await;
    let events = collect(rx).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind(), EventKind::Request);
    assert_eq!(events[1].kind(), EventKind::Response);
    assert_eq!(summary.transactions, 1);
    assert!(matches!(
        summary.close,
        CloseReason::Failed(PairError::Upstream(StreamError::Parse(_)))
    ));
    assert_eq!(h.up_cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.down_cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_downstream_failure_after_request_emitted() {
    let (tx, rx) = mpsc::channel(16);
    let (up, _) = get_transactions(1);
    let down = vec![Step::Status(200, "OK"), Step::Fail(StreamError::UnexpectedEof)];
    let h = harness(0, tx, up, down);

    let summary = h.pair.run().await;
    let events = collect(rx).await;

    // The request had already gone out; no response follows it
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), EventKind::Request);
    assert!(matches!(
        summary.close,
        CloseReason::Failed(PairError::Downstream(StreamError::UnexpectedEof))
    ));
    assert_eq!(h.up_cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.down_cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_closed_sink_ends_pair() {
    let (tx, rx) = mpsc::channel(16);
    drop(rx);
    let (up, down) = get_transactions(2);
    let h = harness(0, tx, up, down);

    let summary = h.pair.run().await;

    assert!(matches!(summary.close, CloseReason::Failed(PairError::SinkClosed)));
    assert_eq!(h.up_cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.down_cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_downstream_is_detached() {
    let (tx, _rx) = mpsc::channel(16);
    let upstream = ScriptedStream::new(upstream_key(), vec![]);
    let cancels = upstream.cancels.clone();

    let mut pair = StreamPair::new(3, tx);
    assert!(pair.attach_upstream(upstream).is_ok());

    let summary = pair.run().await;

    assert!(matches!(summary.close, CloseReason::Detached));
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streams_cannot_be_reassigned() {
    let (tx, _rx) = mpsc::channel(16);
    let mut pair = StreamPair::new(0, tx);

    assert!(pair.attach_upstream(ScriptedStream::new(upstream_key(), vec![])).is_ok());
    let rejected = pair.attach_upstream(ScriptedStream::new(upstream_key(), vec![]));
    assert!(rejected.is_err());
}

#[tokio::test]
async fn test_shutdown_signal_stops_blocked_pair() {
    let (tx, _rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let h = harness(0, tx, vec![Step::Hang], vec![]);

    let task = h.pair.with_shutdown(shutdown_rx).spawn();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!task.is_finished());

    shutdown_tx.send(true).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("pair should stop after shutdown")
        .unwrap();

    assert!(matches!(summary.close, CloseReason::Shutdown));
    assert_eq!(h.up_cancels.load(Ordering::SeqCst), 1);
    assert_eq!(h.down_cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_saturated_channel_blocks_only_the_sender() {
    let (tx, mut rx) = mpsc::channel(1);
    let (up, down) = get_transactions(2);
    let blocked = harness(1, tx.clone(), up, down);
    let blocked_task = blocked.pair.spawn();

    // Give the first pair time to fill the channel and block on its next send
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked_task.is_finished());

    // A second pair on the same channel still runs to its own failure
    let failing = harness(
        2,
        tx,
        vec![Step::Request("GET", "/"), Step::Fail(StreamError::UnexpectedEof)],
        vec![],
    );
    let failing_summary = tokio::time::timeout(Duration::from_secs(1), failing.pair.spawn())
        .await
        .expect("independent pair should not be blocked")
        .unwrap();
    assert!(matches!(failing_summary.close, CloseReason::Failed(_)));
    assert!(!blocked_task.is_finished());

    // Draining the channel lets the blocked pair finish
    let mut received = Vec::new();
    while let Some(event) = rx.recv().await {
        received.push(event);
    }
    let summary = blocked_task.await.unwrap();

    assert_eq!(received.len(), 4);
    assert!(received.iter().all(|e| e.stream_seq() == 1));
    assert_eq!(summary.transactions, 2);
}
