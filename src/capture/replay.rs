//! Replays recorded half-streams through a stream pair.
//!
//! Each direction is read from its own file and pushed in fixed-size
//! segments. Timestamps are synthetic: they start at the replay time and
//! advance by [`SEGMENT_SPACING`] per segment, so event timings reflect byte
//! positions rather than original capture times.

use std::time::{Duration, SystemTime};

use anyhow::Context;
use bytes::Bytes;

use crate::capture::{Connection, ConnectionFactory};
use crate::config::{CaptureConfig, ReplayConfig};
use crate::stream::{HalfStreamFeed, PairSummary};

pub const SEGMENT_SPACING: Duration = Duration::from_micros(100);

/// Feeds both files of `capture` into a new connection and waits for its
/// stream pair to finish.
pub async fn replay(
    factory: &ConnectionFactory,
    capture: &CaptureConfig,
    settings: &ReplayConfig,
) -> anyhow::Result<PairSummary> {
    let upstream = tokio::fs::read(&capture.upstream)
        .await
        .with_context(|| format!("failed to read {}", capture.upstream.display()))?;
    let downstream = tokio::fs::read(&capture.downstream)
        .await
        .with_context(|| format!("failed to read {}", capture.downstream.display()))?;

    replay_bytes(factory, capture, Bytes::from(upstream), Bytes::from(downstream), settings.segment_size).await
}

/// Like [`replay`], with both directions already in memory.
pub async fn replay_bytes(
    factory: &ConnectionFactory,
    capture: &CaptureConfig,
    upstream: Bytes,
    downstream: Bytes,
    segment_size: usize,
) -> anyhow::Result<PairSummary> {
    let Connection {
        seq,
        upstream: up_feed,
        downstream: down_feed,
        task,
        ..
    } = factory.open(capture.client, capture.server);

    let base = SystemTime::now();
    let (up_sent, down_sent) = tokio::join!(
        feed(up_feed, upstream, segment_size, base),
        feed(down_feed, downstream, segment_size, base),
    );

    tracing::debug!(conn_seq = seq, up_sent, down_sent, "replay feeds finished");

    task.await.context("stream pair task failed")
}

/// Pushes `data` in segments until done or the reader stops. Returns the
/// number of bytes accepted.
async fn feed(mut feed: HalfStreamFeed, data: Bytes, segment_size: usize, base: SystemTime) -> usize {
    let segment_size = segment_size.max(1);
    let mut offset = 0;
    let mut index = 0u32;

    while offset < data.len() {
        let end = (offset + segment_size).min(data.len());
        let seen = base + SEGMENT_SPACING * index;

        if feed.push(data.slice(offset..end), seen).await.is_err() {
            tracing::trace!(key = %feed.key(), offset, "reader stopped during replay");
            return offset;
        }

        offset = end;
        index += 1;
    }

    feed.finish();
    offset
}
