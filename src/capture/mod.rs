//! Connection setup between the reassembly side and the stream pairs.
//!
//! # Responsibilities
//! - Allocate a unique sequence number per TCP connection
//! - Build the upstream/downstream readers and their feeds
//! - Spawn one stream pair task per connection

pub mod replay;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::http::event::Event;
use crate::stream::{HalfStreamFeed, HalfStreamReader, PairSummary, ReaderLimits, StreamKey, StreamPair};

/// A running connection: the feeds to push reassembled bytes into and the
/// task pairing them.
#[derive(Debug)]
pub struct Connection {
    pub seq: u64,
    pub key: StreamKey,
    /// Client→server bytes.
    pub upstream: HalfStreamFeed,
    /// Server→client bytes.
    pub downstream: HalfStreamFeed,
    pub task: JoinHandle<PairSummary>,
}

/// Creates stream pairs for new connections, all writing to one event channel.
#[derive(Debug)]
pub struct ConnectionFactory {
    // Relaxed ordering is enough: only uniqueness matters
    next_seq: AtomicU64,
    events: mpsc::Sender<Event>,
    limits: ReaderLimits,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionFactory {
    pub fn new(events: mpsc::Sender<Event>, limits: ReaderLimits, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            events,
            limits,
            shutdown,
        }
    }

    /// Opens a connection between `client` and `server` and starts pairing it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, client: SocketAddr, server: SocketAddr) -> Connection {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = StreamKey::new(client, server);

        let (up_reader, up_feed) = HalfStreamReader::channel(key, self.limits.clone());
        let (down_reader, down_feed) = HalfStreamReader::channel(key.reverse(), self.limits.clone());

        let mut pair = StreamPair::new(seq, self.events.clone()).with_shutdown(self.shutdown.clone());
        // A fresh pair has nothing attached, so neither call can hand the reader back
        let _ = pair.attach_upstream(up_reader);
        let _ = pair.attach_downstream(down_reader);

        tracing::debug!(conn_seq = seq, key = %key, "HTTP stream pair opened");

        Connection {
            seq,
            key,
            upstream: up_feed,
            downstream: down_feed,
            task: pair.spawn(),
        }
    }

    /// Number of connections opened so far.
    pub fn opened(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }
}
