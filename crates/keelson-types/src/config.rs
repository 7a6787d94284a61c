//! Engine configuration types for Keelson.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! logging, timer delivery, and checkpoint limits.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level configuration for the execution engine.
///
/// Loaded from `~/.keelson/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
            otel: false,
        }
    }
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Error)]
#[error("unknown log format '{0}' (expected 'pretty' or 'json')")]
pub struct UnknownLogFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(UnknownLogFormat(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

/// Timer delivery settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Subscriptions expiring within this many milliseconds of "now" are
    /// treated as due when the host drains expired timers.
    #[serde(default)]
    pub delivery_tolerance_ms: u64,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Checkpoint limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Largest accepted serialized execution-tree image, in bytes.
    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: usize,
}

fn default_max_snapshot_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_snapshot_bytes: default_max_snapshot_bytes(),
        }
    }
}
