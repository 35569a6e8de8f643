//! Half-streams and the stream pair engine.
//!
//! A TCP connection is observed as two independent half-streams: client→server
//! (upstream) and server→client (downstream). Each one is exposed through the
//! [`HalfStream`] trait as a sequence of blocking, structured reads. A
//! [`StreamPair`] owns both halves of one connection and turns them into
//! request/response events.

pub mod pair;
pub mod reader;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::http::event::HeaderItem;
use crate::http::parser::{BodyOrigin, ParseError, RequestLine, StatusLine};

pub use pair::{CloseReason, PairError, PairSummary, StreamPair};
pub use reader::{FeedError, HalfStreamFeed, HalfStreamReader, ReaderLimits};

/// Identifies one direction of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl StreamKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    /// Key of the opposite direction of the same connection.
    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.src, self.dst)
    }
}

/// Errors raised while reading from a half-stream.
///
/// Every variant is fatal to the connection that owns the stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Start line, header line or body framing could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The stream ended cleanly on a message boundary.
    #[error("stream closed")]
    Closed,

    /// The stream ended in the middle of a message.
    #[error("stream ended mid-message")]
    UnexpectedEof,

    #[error("{0} limit exceeded")]
    LimitExceeded(&'static str),

    /// The reader was cancelled and will not produce anything further.
    #[error("stream cancelled")]
    Cancelled,
}

/// One direction of a TCP connection, exposed as structured HTTP reads.
///
/// Reads suspend until enough bytes are available or the stream ends.
/// Implementations track the timestamp of the most recently consumed byte
/// and own a one-shot stop signal fired by [`HalfStream::cancel`].
pub trait HalfStream: Send {
    fn key(&self) -> StreamKey;

    /// Timestamp of the last byte consumed by any read so far.
    fn last_seen(&self) -> SystemTime;

    fn read_request_line(&mut self) -> impl Future<Output = Result<RequestLine, StreamError>> + Send;

    fn read_response_line(&mut self) -> impl Future<Output = Result<StatusLine, StreamError>> + Send;

    /// Reads header lines up to and including the empty line that ends the block.
    fn read_headers(&mut self) -> impl Future<Output = Result<Vec<HeaderItem>, StreamError>> + Send;

    /// Reads a message body; framing follows from `method`, `headers` and `origin`.
    fn read_body(
        &mut self,
        method: &str,
        headers: &[HeaderItem],
        origin: BodyOrigin,
    ) -> impl Future<Output = Result<Vec<u8>, StreamError>> + Send;

    /// Fires the stop signal. Calls after the first are no-ops.
    fn cancel(&mut self);
}
