use std::sync::Arc;

use anyhow::Context;
use httpstitch::capture::{ConnectionFactory, replay};
use httpstitch::config::Config;
use httpstitch::sink::{self, LogSink};
use httpstitch::stream::{CloseReason, PairSummary};
use tokio::sync::watch;
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(cfg.level()?)
        .init();

    if cfg.captures.is_empty() {
        tracing::warn!("No captures configured, nothing to replay");
        return Ok(());
    }

    let (events_tx, events_rx) = sink::channel(cfg.channel_capacity);
    let mut log_sink = LogSink::new(events_rx);
    if cfg.replay.dump_events {
        log_sink = log_sink.with_dump(std::io::stdout());
    }
    let sink_task = tokio::spawn(log_sink.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let factory = Arc::new(ConnectionFactory::new(events_tx, cfg.reader.clone(), shutdown_rx));

    let mut replays = JoinSet::new();
    for capture in cfg.captures.iter().cloned() {
        let factory = Arc::clone(&factory);
        let settings = cfg.replay.clone();
        replays.spawn(async move { replay::replay(&factory, &capture, &settings).await });
    }
    // The sink finishes once every sender, including the factory's, is gone
    drop(factory);

    let interrupted = tokio::select! {
        _ = join_replays(&mut replays) => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
        join_replays(&mut replays).await;
    }

    let stats = sink_task.await.context("event sink task failed")??;
    tracing::info!(
        requests = stats.requests,
        responses = stats.responses,
        "Replay finished"
    );

    Ok(())
}

async fn join_replays(replays: &mut JoinSet<anyhow::Result<PairSummary>>) {
    while let Some(joined) = replays.join_next().await {
        match joined {
            Ok(Ok(summary)) => log_summary(&summary),
            Ok(Err(e)) => tracing::error!("Replay failed: {:#}", e),
            Err(e) => tracing::error!("Replay task failed: {}", e),
        }
    }
}

fn log_summary(summary: &PairSummary) {
    match &summary.close {
        CloseReason::Failed(e) => tracing::warn!(
            conn_seq = summary.conn_seq,
            transactions = summary.transactions,
            error = %e,
            "Connection discarded"
        ),
        reason => tracing::info!(
            conn_seq = summary.conn_seq,
            transactions = summary.transactions,
            reason = ?reason,
            "Connection closed"
        ),
    }
}
