//! Runtime configuration: poll timeouts, batch tuning, snapshot and echo
//! cadence. Loaded from an optional project-local TOML file and merged
//! over built-in defaults; a CLI flag always wins over the file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Known top-level config keys, kept in sync with [`AppConfig`]'s fields.
const KNOWN_KEYS: &[&str] = &[
  "server_poll_timeout_ms",
  "client_poll_timeout_ms",
  "initial_batch_delay_ms",
  "batch_delay_margin_ms",
  "snapshot_interval_secs",
  "echo_interval_secs",
  "log_level",
];

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
  server_poll_timeout_ms: Option<u64>,
  client_poll_timeout_ms: Option<u64>,
  initial_batch_delay_ms: Option<u64>,
  batch_delay_margin_ms: Option<u64>,
  snapshot_interval_secs: Option<u64>,
  echo_interval_secs: Option<u64>,
  log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
  /// How long the server's interactive-socket read blocks before giving up
  /// and re-checking its shutdown flag.
  pub server_poll_timeout: Duration,
  /// How long the client's broadcast-socket read blocks before giving up
  /// and re-checking its shutdown flag.
  pub client_poll_timeout: Duration,
  /// `batchDelay` before the server has observed any subscriber latency.
  pub initial_batch_delay: Duration,
  /// Added on top of the worst observed round-trip latency to get `batchDelay`.
  pub batch_delay_margin: Duration,
  /// How often the server writes the document to its snapshot file.
  pub snapshot_interval: Duration,
  /// How often a client refreshes its clock offset and sends an echo probe.
  pub echo_interval: Duration,
  pub log_level: String,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      server_poll_timeout: Duration::from_secs(2),
      client_poll_timeout: Duration::from_millis(500),
      initial_batch_delay: Duration::from_millis(250),
      batch_delay_margin: Duration::from_millis(50),
      snapshot_interval: Duration::from_secs(30),
      echo_interval: Duration::from_secs(30),
      log_level: "info".to_string(),
    }
  }
}

impl AppConfig {
  /// Load defaults, then merge a project-local TOML file over them if
  /// `path` is given and exists.
  pub fn load(path: Option<&Path>) -> Result<Self> {
    let mut cfg = Self::default();
    let Some(path) = path else {
      return Ok(cfg);
    };
    if !path.exists() {
      return Ok(cfg);
    }
    let text = fs::read_to_string(path)
      .with_context(|| format!("failed to read config file {}", path.display()))?;
    warn_unknown_keys(&text, path);
    let raw: RawConfig =
      toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    if let Some(v) = raw.server_poll_timeout_ms {
      cfg.server_poll_timeout = Duration::from_millis(v);
    }
    if let Some(v) = raw.client_poll_timeout_ms {
      cfg.client_poll_timeout = Duration::from_millis(v);
    }
    if let Some(v) = raw.initial_batch_delay_ms {
      cfg.initial_batch_delay = Duration::from_millis(v);
    }
    if let Some(v) = raw.batch_delay_margin_ms {
      cfg.batch_delay_margin = Duration::from_millis(v);
    }
    if let Some(v) = raw.snapshot_interval_secs {
      cfg.snapshot_interval = Duration::from_secs(v);
    }
    if let Some(v) = raw.echo_interval_secs {
      cfg.echo_interval = Duration::from_secs(v);
    }
    if let Some(v) = raw.log_level {
      cfg.log_level = v;
    }
    Ok(cfg)
  }

  /// CLI flag takes precedence over whatever the config file set.
  pub fn with_log_level_override(mut self, level: Option<String>) -> Self {
    if let Some(level) = level {
      self.log_level = level;
    }
    self
  }
}

fn warn_unknown_keys(text: &str, path: &Path) {
  let Ok(value) = text.parse::<toml::Value>() else {
    return;
  };
  let Some(table) = value.as_table() else {
    return;
  };
  for key in table.keys() {
    if !KNOWN_KEYS.contains(&key.as_str()) {
      log::warn!("unknown config key '{key}' in {}", path.display());
    }
  }
}
