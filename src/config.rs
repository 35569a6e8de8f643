use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, ensure};
use serde::Deserialize;

use crate::stream::ReaderLimits;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_ENV: &str = "STITCH_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Capacity of the shared event channel; a full channel blocks every pair.
    pub channel_capacity: usize,
    pub reader: ReaderLimits,
    pub replay: ReplayConfig,
    pub captures: Vec<CaptureConfig>,
}

/// How recorded half-streams are fed back in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Bytes per pushed segment.
    pub segment_size: usize,
    /// Write every event to stdout as a YAML document.
    pub dump_events: bool,
}

/// One recorded TCP connection: its endpoints and a file per direction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CaptureConfig {
    pub client: SocketAddr,
    pub server: SocketAddr,
    /// Client→server bytes.
    pub upstream: PathBuf,
    /// Server→client bytes.
    pub downstream: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            channel_capacity: 1024,
            reader: ReaderLimits::default(),
            replay: ReplayConfig::default(),
            captures: Vec::new(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            segment_size: 1460,
            dump_events: false,
        }
    }
}

impl Config {
    /// Loads the file named by `STITCH_CONFIG`, or the defaults when unset.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("in config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(content).context("invalid YAML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.channel_capacity > 0, "channel_capacity must be non-zero");
        ensure!(self.replay.segment_size > 0, "replay.segment_size must be non-zero");
        ensure!(self.reader.max_line_len > 0, "reader.max_line_len must be non-zero");
        ensure!(self.reader.max_headers > 0, "reader.max_headers must be non-zero");
        ensure!(self.reader.segment_queue > 0, "reader.segment_queue must be non-zero");
        self.level()?;
        Ok(())
    }

    pub fn level(&self) -> anyhow::Result<tracing::Level> {
        self.log_level
            .parse()
            .with_context(|| format!("invalid log_level {:?}", self.log_level))
    }
}
