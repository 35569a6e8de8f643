//! Consumer side of the shared event channel.
//!
//! Every stream pair writes into one bounded channel. The channel is the
//! backpressure point: when it is full, `send` suspends the pair until the
//! sink catches up. Events from different connections arrive interleaved in no
//! particular order; `stream_seq` tells them apart.

use std::io::Write;

use tokio::sync::mpsc;
use tracing::info;

use crate::http::event::Event;

/// Builds the shared event channel.
pub fn channel(capacity: usize) -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub requests: u64,
    pub responses: u64,
}

/// Drains the channel, logging one line per event and optionally writing
/// each event as a YAML document.
pub struct LogSink {
    events: mpsc::Receiver<Event>,
    dump: Option<Box<dyn Write + Send>>,
    stats: SinkStats,
}

impl LogSink {
    pub fn new(events: mpsc::Receiver<Event>) -> Self {
        Self {
            events,
            dump: None,
            stats: SinkStats::default(),
        }
    }

    pub fn with_dump(mut self, out: impl Write + Send + 'static) -> Self {
        self.dump = Some(Box::new(out));
        self
    }

    /// Runs until every sender is gone.
    pub async fn run(mut self) -> anyhow::Result<SinkStats> {
        while let Some(event) = self.events.recv().await {
            self.record(&event)?;
        }
        Ok(self.stats)
    }

    fn record(&mut self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::Request(req) => {
                self.stats.requests += 1;
                info!(
                    conn_seq = req.envelope.stream_seq(),
                    client = %req.endpoints.client,
                    server = %req.endpoints.server,
                    method = %req.method,
                    uri = %String::from_utf8_lossy(&req.uri),
                    body_len = req.body.len(),
                    "HTTP request"
                );
            }
            Event::Response(resp) => {
                self.stats.responses += 1;
                info!(
                    conn_seq = resp.envelope.stream_seq(),
                    client = %resp.endpoints.client,
                    server = %resp.endpoints.server,
                    status = resp.code,
                    reason = %String::from_utf8_lossy(&resp.reason),
                    body_len = resp.body.len(),
                    "HTTP response"
                );
            }
        }

        if let Some(out) = self.dump.as_mut() {
            out.write_all(b"---\n")?;
            serde_yaml::to_writer(&mut *out, event)?;
            out.flush()?;
        }

        Ok(())
    }
}
