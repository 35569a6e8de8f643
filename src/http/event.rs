use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Serialize, Serializer};

use crate::stream::StreamKey;

/// A single header line as it appeared on the wire.
///
/// Events keep headers as an ordered list rather than a map: HTTP allows the
/// same name to repeat (`Set-Cookie`, `Via`, ...) and the order carries meaning.
/// Values are raw bytes since they may carry obs-text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderItem {
    pub name: String,
    #[serde(serialize_with = "raw_text")]
    pub value: Bytes,
}

impl HeaderItem {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Discriminates the two event variants on the output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "HTTPRequest")]
    Request,
    #[serde(rename = "HTTPResponse")]
    Response,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Request => f.write_str("HTTPRequest"),
            EventKind::Response => f.write_str("HTTPResponse"),
        }
    }
}

/// Fields shared by every event: kind, timing and the connection it came from.
///
/// The fields are private so the kind can never change after construction,
/// and `end` is never earlier than `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: EventKind,
    start: SystemTime,
    end: SystemTime,
    stream_seq: u64,
}

impl Envelope {
    pub fn new(kind: EventKind, start: SystemTime, end: SystemTime, stream_seq: u64) -> Self {
        Self {
            kind,
            start,
            end: end.max(start),
            stream_seq,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Timestamp of the last byte of the start line.
    pub fn start(&self) -> SystemTime {
        self.start
    }

    /// Timestamp of the last byte of the body.
    pub fn end(&self) -> SystemTime {
        self.end
    }

    /// Connection sequence number of the stream pair that produced the event.
    pub fn stream_seq(&self) -> u64 {
        self.stream_seq
    }
}

/// Client and server socket addresses of one TCP connection.
///
/// Rendered as `host:port` only when displayed or serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoints {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl From<StreamKey> for Endpoints {
    /// Builds endpoints from the client→server half-stream key.
    fn from(key: StreamKey) -> Self {
        Self {
            client: key.src,
            server: key.dst,
        }
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.server)
    }
}

/// A fully parsed HTTP request observed on the client→server half-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub method: String,
    #[serde(serialize_with = "raw_text")]
    pub uri: Bytes,
    pub version: String,
    pub headers: Vec<HeaderItem>,
    pub body: Vec<u8>,
}

/// A fully parsed HTTP response observed on the server→client half-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseEvent {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(flatten)]
    pub endpoints: Endpoints,
    pub version: String,
    pub code: u16,
    #[serde(serialize_with = "raw_text")]
    pub reason: Bytes,
    pub headers: Vec<HeaderItem>,
    pub body: Vec<u8>,
}

impl RequestEvent {
    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }
}

impl ResponseEvent {
    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [HeaderItem], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_ref())
}

/// Writes wire text as a string when it is UTF-8 and as a byte list otherwise.
fn raw_text<S: Serializer>(raw: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    match std::str::from_utf8(raw) {
        Ok(text) => serializer.serialize_str(text),
        Err(_) => serializer.collect_seq(raw.iter()),
    }
}

/// Value carried by the output channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Request(RequestEvent),
    Response(ResponseEvent),
}

impl Event {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Event::Request(req) => &req.envelope,
            Event::Response(resp) => &resp.envelope,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.envelope().kind()
    }

    pub fn stream_seq(&self) -> u64 {
        self.envelope().stream_seq()
    }

    pub fn endpoints(&self) -> Endpoints {
        match self {
            Event::Request(req) => req.endpoints,
            Event::Response(resp) => resp.endpoints,
        }
    }
}
