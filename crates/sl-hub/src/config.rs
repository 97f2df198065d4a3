//! # Coordinator Configuration
//!
//! Loaded from the `[coordinator]` table of a TOML file, or from a bare
//! table. Every key is optional.
//!
//! ```toml
//! [coordinator]
//! query_timeout_secs = 300
//! restart_wait_ms = 10000
//! max_running_queries = 8
//! event_buffer = 10
//! max_scroll_from = 10000
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid coordinator config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Process-wide query timeout. 0 disables the watchdog.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// How long a restart waits for the other source to confirm.
    #[serde(default = "default_restart_wait")]
    pub restart_wait_ms: u64,
    #[serde(default = "default_max_running")]
    pub max_running_queries: usize,
    /// Capacity of each per-query state channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_max_scroll")]
    pub max_scroll_from: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_query_timeout(),
            restart_wait_ms: default_restart_wait(),
            max_running_queries: default_max_running(),
            event_buffer: default_event_buffer(),
            max_scroll_from: default_max_scroll(),
        }
    }
}

fn default_query_timeout() -> u64 {
    300
}
fn default_restart_wait() -> u64 {
    10_000
}
fn default_max_running() -> usize {
    8
}
fn default_event_buffer() -> usize {
    10
}
fn default_max_scroll() -> u64 {
    10_000
}

#[derive(Deserialize)]
struct FileConfig {
    coordinator: Option<CoordinatorConfig>,
}

impl CoordinatorConfig {
    /// Parse either a document with a `[coordinator]` table or the bare keys.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let value: toml::Table = toml::from_str(text)?;
        if value.contains_key("coordinator") {
            let file: FileConfig = toml::from_str(text)?;
            return Ok(file.coordinator.unwrap_or_default());
        }
        Ok(toml::from_str(text)?)
    }

    /// Missing files fall back to defaults, as an unconfigured process would.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_secs > 0).then(|| Duration::from_secs(self.query_timeout_secs))
    }

    pub fn restart_wait(&self) -> Duration {
        Duration::from_millis(self.restart_wait_ms)
    }
}
