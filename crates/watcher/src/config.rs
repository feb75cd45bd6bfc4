//! Watch configuration
//!
//! Loaded from TOML, e.g.:
//! ```toml
//! latency_ms = 150
//! stack_size = 524288
//! strict_paths = false
//! backend = "auto"
//! ```

use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which native facility the event loop subscribes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native facility when the platform supports it, no-op otherwise
    #[default]
    Auto,
    /// Native facility, regardless of the capability check
    Native,
    /// No-op watches
    Null,
}

/// Configuration for an [`EventLoop`](crate::EventLoop) and the watches it creates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Coalescing window handed to every native stream (default: 150ms)
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,

    /// Stack size of the notification thread in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Name given to the notification thread
    #[serde(default = "default_thread_name")]
    pub thread_name: String,

    /// Fail `watch` with `InvalidPath` instead of watching the unresolved path
    #[serde(default)]
    pub strict_paths: bool,

    /// Native facility selection
    #[serde(default)]
    pub backend: BackendKind,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_latency_ms(),
            stack_size: default_stack_size(),
            thread_name: default_thread_name(),
            strict_paths: false,
            backend: BackendKind::Auto,
        }
    }
}

impl WatchConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| WatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Coalescing window as a `Duration`
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.latency_ms > 60_000 {
            return Err(WatchError::Config(format!(
                "latency_ms must be at most 60000 (got {})",
                self.latency_ms
            )));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(WatchError::Config(format!(
                "stack_size must be at least {} bytes (got {})",
                MIN_STACK_SIZE, self.stack_size
            )));
        }
        Ok(())
    }
}

const MIN_STACK_SIZE: usize = 64 * 1024;

fn default_latency_ms() -> u64 {
    150
}

fn default_stack_size() -> usize {
    512 * 1024
}

fn default_thread_name() -> String {
    "fsevents-runloop".to_string()
}
