//! Buffered half-stream reader fed by the reassembly side.
//!
//! The reassembler pushes ordered segments into a [`HalfStreamFeed`]; the
//! paired [`HalfStreamReader`] buffers them and hands out HTTP lines and
//! bodies. Each segment carries the time it was seen on the wire so the reader
//! can report when the last consumed byte arrived.

use std::collections::VecDeque;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::http::event::HeaderItem;
use crate::http::parser::{self, BodyOrigin, Framing, ParseError, RequestLine, StatusLine};
use crate::stream::{HalfStream, StreamError, StreamKey};

/// Bounds applied while reading a single half-stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaderLimits {
    /// Longest start, header or chunk-size line accepted, in bytes.
    pub max_line_len: usize,
    /// Most header lines accepted in one header block.
    pub max_headers: usize,
    /// Largest body accepted, after chunked decoding.
    pub max_body_len: usize,
    /// Segments the feed may queue ahead of the reader.
    pub segment_queue: usize,
}

impl Default for ReaderLimits {
    fn default() -> Self {
        Self {
            max_line_len: 64 * 1024,
            max_headers: 128,
            max_body_len: 16 * 1024 * 1024,
            segment_queue: 64,
        }
    }
}

#[derive(Debug)]
struct Segment {
    data: Bytes,
    seen: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// The reader cancelled the stream or was dropped.
    #[error("half-stream reader stopped")]
    Stopped,
}

/// Producer side of a half-stream.
///
/// Dropping the feed (or calling [`HalfStreamFeed::finish`]) marks the end of
/// the stream once the reader has drained what was already pushed.
#[derive(Debug)]
pub struct HalfStreamFeed {
    key: StreamKey,
    segments: mpsc::Sender<Segment>,
    stop: oneshot::Receiver<()>,
    stopped: bool,
}

impl HalfStreamFeed {
    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Appends one segment of reassembled bytes seen at `seen`.
    ///
    /// Suspends while the segment queue is full. Fails once the reader has
    /// been cancelled or dropped.
    pub async fn push(&mut self, data: impl Into<Bytes>, seen: SystemTime) -> Result<(), FeedError> {
        if self.stopped {
            return Err(FeedError::Stopped);
        }

        let segment = Segment {
            data: data.into(),
            seen,
        };

        let result = tokio::select! {
            biased;
            _ = &mut self.stop => Err(FeedError::Stopped),
            sent = self.segments.send(segment) => sent.map_err(|_| FeedError::Stopped),
        };

        if result.is_err() {
            self.stopped = true;
        }
        result
    }

    /// Resolves once the reader has fired its stop signal or gone away.
    pub async fn stopped(&mut self) {
        if !self.stopped {
            let _ = (&mut self.stop).await;
            self.stopped = true;
        }
    }

    pub fn is_stopped(&mut self) -> bool {
        if !self.stopped && !matches!(self.stop.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            self.stopped = true;
        }
        self.stopped
    }

    /// Marks the end of the stream.
    pub fn finish(self) {
        tracing::trace!(key = %self.key, "half-stream feed finished");
    }
}

/// Consumer side of a half-stream, implementing [`HalfStream`].
#[derive(Debug)]
pub struct HalfStreamReader {
    key: StreamKey,
    limits: ReaderLimits,
    segments: mpsc::Receiver<Segment>,
    buf: BytesMut,
    // Bytes still buffered from each segment, oldest first, with its timestamp
    marks: VecDeque<(usize, SystemTime)>,
    last_seen: SystemTime,
    eof: bool,
    stop: Option<oneshot::Sender<()>>,
}

impl HalfStreamReader {
    /// Creates a reader and the feed that supplies it.
    pub fn channel(key: StreamKey, limits: ReaderLimits) -> (HalfStreamReader, HalfStreamFeed) {
        let (segment_tx, segment_rx) = mpsc::channel(limits.segment_queue.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();

        let reader = HalfStreamReader {
            key,
            limits,
            segments: segment_rx,
            buf: BytesMut::with_capacity(4096),
            marks: VecDeque::new(),
            last_seen: SystemTime::UNIX_EPOCH,
            eof: false,
            stop: Some(stop_tx),
        };

        let feed = HalfStreamFeed {
            key,
            segments: segment_tx,
            stop: stop_rx,
            stopped: false,
        };

        (reader, feed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_none()
    }

    /// Pulls the next segment into the buffer. Returns `false` at end of stream.
    async fn fill(&mut self) -> Result<bool, StreamError> {
        if self.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if self.eof {
            return Ok(false);
        }

        match self.segments.recv().await {
            Some(segment) => {
                if !segment.data.is_empty() {
                    self.marks.push_back((segment.data.len(), segment.seen));
                    self.buf.extend_from_slice(&segment.data);
                }
                Ok(true)
            }
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Removes `n` buffered bytes and advances `last_seen` past them.
    fn consume(&mut self, n: usize) -> BytesMut {
        let mut left = n;
        while left > 0 {
            let Some(front) = self.marks.front_mut() else {
                break;
            };
            let take = left.min(front.0);
            front.0 -= take;
            left -= take;
            if front.1 > self.last_seen {
                self.last_seen = front.1;
            }
            if front.0 == 0 {
                self.marks.pop_front();
            }
        }

        self.buf.split_to(n)
    }

    /// Reads one line, stripping the CRLF (or bare LF) terminator.
    async fn read_line(&mut self) -> Result<BytesMut, StreamError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|b| *b == b'\n') {
                let end = scanned + pos;
                if end > self.limits.max_line_len {
                    return Err(StreamError::LimitExceeded("line length"));
                }

                let mut line = self.consume(end + 1);
                line.truncate(end);
                if line.last() == Some(&b'\r') {
                    line.truncate(end - 1);
                }
                return Ok(line);
            }

            scanned = self.buf.len();
            if scanned > self.limits.max_line_len {
                return Err(StreamError::LimitExceeded("line length"));
            }

            if !self.fill().await? {
                return Err(StreamError::UnexpectedEof);
            }
        }
    }

    /// Reads a start line, skipping empty lines left between messages.
    async fn read_start_line(&mut self) -> Result<BytesMut, StreamError> {
        loop {
            while self.buf.is_empty() {
                if !self.fill().await? {
                    return Err(StreamError::Closed);
                }
            }

            let line = self.read_line().await?;
            if !line.is_empty() {
                return Ok(line);
            }
        }
    }

    async fn read_exact(&mut self, n: usize) -> Result<BytesMut, StreamError> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Err(StreamError::UnexpectedEof);
            }
        }
        Ok(self.consume(n))
    }

    async fn read_chunked(&mut self) -> Result<Vec<u8>, StreamError> {
        let mut body = Vec::new();
        loop {
            let size_line = self.read_line().await?;
            let size = parser::parse_chunk_size(&size_line)?;

            if size == 0 {
                // Trailer section; discarded
                while !self.read_line().await?.is_empty() {}
                return Ok(body);
            }

            if body.len().saturating_add(size) > self.limits.max_body_len {
                return Err(StreamError::LimitExceeded("body length"));
            }

            let chunk = self.read_exact(size).await?;
            body.extend_from_slice(&chunk);

            if !self.read_line().await?.is_empty() {
                return Err(ParseError::MissingChunkTerminator.into());
            }
        }
    }

    async fn read_to_close(&mut self) -> Result<Vec<u8>, StreamError> {
        while self.fill().await? {
            if self.buf.len() > self.limits.max_body_len {
                return Err(StreamError::LimitExceeded("body length"));
            }
        }
        let len = self.buf.len();
        Ok(self.consume(len).to_vec())
    }
}

impl HalfStream for HalfStreamReader {
    fn key(&self) -> StreamKey {
        self.key
    }

    fn last_seen(&self) -> SystemTime {
        self.last_seen
    }

    async fn read_request_line(&mut self) -> Result<RequestLine, StreamError> {
        let line = self.read_start_line().await?;
        Ok(parser::parse_request_line(&line)?)
    }

    async fn read_response_line(&mut self) -> Result<StatusLine, StreamError> {
        let line = self.read_start_line().await?;
        Ok(parser::parse_status_line(&line)?)
    }

    async fn read_headers(&mut self) -> Result<Vec<HeaderItem>, StreamError> {
        let mut headers = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            if headers.len() >= self.limits.max_headers {
                return Err(StreamError::LimitExceeded("header count"));
            }
            headers.push(parser::parse_header_line(&line)?);
        }
    }

    async fn read_body(
        &mut self,
        method: &str,
        headers: &[HeaderItem],
        origin: BodyOrigin,
    ) -> Result<Vec<u8>, StreamError> {
        match parser::body_framing(method, headers, origin)? {
            Framing::Empty => Ok(Vec::new()),
            Framing::Length(n) if n > self.limits.max_body_len => {
                Err(StreamError::LimitExceeded("body length"))
            }
            Framing::Length(n) => Ok(self.read_exact(n).await?.to_vec()),
            Framing::Chunked => self.read_chunked().await,
            Framing::UntilClose => self.read_to_close().await,
        }
    }

    fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            self.segments.close();
            tracing::trace!(key = %self.key, "half-stream reader cancelled");
        }
    }
}
