//! Per-connection request/response transaction loop.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::http::event::{Endpoints, Envelope, Event, EventKind, RequestEvent, ResponseEvent};
use crate::http::parser::{BodyOrigin, RequestLine, StatusLine};
use crate::stream::{HalfStream, StreamError};

#[derive(Debug, thiserror::Error)]
pub enum PairError {
    #[error("upstream: {0}")]
    Upstream(#[source] StreamError),
    #[error("downstream: {0}")]
    Downstream(#[source] StreamError),
    #[error("event channel closed")]
    SinkClosed,
}

/// Why a stream pair stopped.
#[derive(Debug)]
pub enum CloseReason {
    /// The upstream ended cleanly between transactions.
    StreamEnded,
    /// A read, parse or send failed; the connection was discarded.
    Failed(PairError),
    /// The external shutdown signal fired.
    Shutdown,
    /// `run` started without both half-streams attached.
    Detached,
}

/// Result of a finished pair, returned by its task.
///
/// This is the only place failure details surface; nothing about them is
/// ever written to the event channel.
#[derive(Debug)]
pub struct PairSummary {
    pub conn_seq: u64,
    /// Completed request/response cycles.
    pub transactions: u64,
    pub close: CloseReason,
}

/// Owns both half-streams of one TCP connection and pairs requests with
/// responses.
///
/// Each call to the transaction step reads one request from the upstream,
/// emits it, then reads and emits the matching response from the
/// downstream. A failure anywhere cancels both half-streams and ends the
/// loop; transactions already emitted stay emitted.
pub struct StreamPair<S> {
    upstream: Option<S>,
    downstream: Option<S>,

    request_seq: u64,
    conn_seq: u64,
    events: mpsc::Sender<Event>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S: HalfStream + 'static> StreamPair<S> {
    pub fn new(conn_seq: u64, events: mpsc::Sender<Event>) -> Self {
        Self {
            upstream: None,
            downstream: None,
            request_seq: 0,
            conn_seq,
            events,
            shutdown: None,
        }
    }

    /// Stops the loop (cancelling both half-streams) once `shutdown` reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn conn_seq(&self) -> u64 {
        self.conn_seq
    }

    /// Binds the client→server half-stream. Hands the stream back if one is
    /// already bound.
    pub fn attach_upstream(&mut self, stream: S) -> Result<(), S> {
        match self.upstream {
            Some(_) => Err(stream),
            None => {
                self.upstream = Some(stream);
                Ok(())
            }
        }
    }

    /// Binds the server→client half-stream. Hands the stream back if one is
    /// already bound.
    pub fn attach_downstream(&mut self, stream: S) -> Result<(), S> {
        match self.downstream {
            Some(_) => Err(stream),
            None => {
                self.downstream = Some(stream);
                Ok(())
            }
        }
    }

    /// Runs the pair on its own task.
    pub fn spawn(self) -> JoinHandle<PairSummary> {
        tokio::spawn(self.run())
    }

    /// Runs transactions until the streams end, something fails or the
    /// shutdown signal fires.
    pub async fn run(mut self) -> PairSummary {
        let (mut upstream, mut downstream) = match (self.upstream.take(), self.downstream.take()) {
            (Some(up), Some(down)) => (up, down),
            (up, down) => {
                for mut stream in up.into_iter().chain(down) {
                    stream.cancel();
                }
                warn!(conn_seq = self.conn_seq, "stream pair started without both half-streams");
                return self.summary(CloseReason::Detached);
            }
        };

        let mut shutdown = self.shutdown.take();

        let close = loop {
            let step = Self::transaction(self.conn_seq, &self.events, &mut upstream, &mut downstream);

            let result = match shutdown.as_mut() {
                Some(signal) => tokio::select! {
                    res = step => res,
                    _ = shutdown_requested(signal) => break CloseReason::Shutdown,
                },
                None => step.await,
            };

            match result {
                Ok(()) => self.request_seq += 1,
                Err(PairError::Upstream(StreamError::Closed)) => break CloseReason::StreamEnded,
                Err(e) => break CloseReason::Failed(e),
            }
        };

        upstream.cancel();
        downstream.cancel();

        match &close {
            CloseReason::Failed(e) => warn!(
                conn_seq = self.conn_seq,
                transactions = self.request_seq,
                error = %e,
                "HTTP stream pair discarded"
            ),
            reason => debug!(
                conn_seq = self.conn_seq,
                transactions = self.request_seq,
                reason = ?reason,
                "HTTP stream pair closed"
            ),
        }

        self.summary(close)
    }

    async fn transaction(
        conn_seq: u64,
        events: &mpsc::Sender<Event>,
        upstream: &mut S,
        downstream: &mut S,
    ) -> Result<(), PairError> {
        let endpoints = Endpoints::from(upstream.key());

        let RequestLine { method, target, version } =
            upstream.read_request_line().await.map_err(PairError::Upstream)?;
        let req_start = upstream.last_seen();
        let req_headers = upstream.read_headers().await.map_err(PairError::Upstream)?;
        let req_body = upstream
            .read_body(&method, &req_headers, BodyOrigin::Request)
            .await
            .map_err(PairError::Upstream)?;

        let request = RequestEvent {
            envelope: Envelope::new(EventKind::Request, req_start, upstream.last_seen(), conn_seq),
            endpoints,
            method: method.clone(),
            uri: target,
            version,
            headers: req_headers,
            body: req_body,
        };
        events
            .send(Event::Request(request))
            .await
            .map_err(|_| PairError::SinkClosed)?;

        let StatusLine { version, code, reason } =
            downstream.read_response_line().await.map_err(PairError::Downstream)?;
        let resp_start = downstream.last_seen();
        let resp_headers = downstream.read_headers().await.map_err(PairError::Downstream)?;
        let resp_body = downstream
            .read_body(&method, &resp_headers, BodyOrigin::Response(code))
            .await
            .map_err(PairError::Downstream)?;

        let response = ResponseEvent {
            envelope: Envelope::new(EventKind::Response, resp_start, downstream.last_seen(), conn_seq),
            endpoints,
            version,
            code,
            reason,
            headers: resp_headers,
            body: resp_body,
        };
        events
            .send(Event::Response(response))
            .await
            .map_err(|_| PairError::SinkClosed)?;

        trace!(conn_seq, method = %method, status = code, "HTTP transaction complete");
        Ok(())
    }

    fn summary(&self, close: CloseReason) -> PairSummary {
        PairSummary {
            conn_seq: self.conn_seq,
            transactions: self.request_seq,
            close,
        }
    }
}

/// Resolves once the signal reads `true`; never resolves if its sender is
/// dropped without signalling.
async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
