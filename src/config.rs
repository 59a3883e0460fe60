//! Runtime configuration for the I/O core.
//!
//! Priority: environment variables > config file > defaults. The file is
//! JSON; every field can be overridden with a `TILEHUB_*` variable so
//! deployments can tune the reactor without shipping a file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables applied to polls and sockets.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Ceiling for one poll iteration, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Whether to set `TCP_NODELAY` on new sockets.
    pub no_delay: bool,
    /// Kernel send buffer size; `None` keeps the OS default.
    #[serde(default)]
    pub send_buffer_size: Option<usize>,
    /// Kernel receive buffer size; `None` keeps the OS default.
    #[serde(default)]
    pub recv_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 5000,
            no_delay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl Config {
    /// Load configuration: `path` if it exists, else defaults, then apply
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("read config: {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("parse config: {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Poll iteration ceiling as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("TILEHUB_POLL_TIMEOUT_MS") {
            if let Ok(timeout) = value.parse() {
                self.poll_timeout_ms = timeout;
            }
        }
        if let Ok(value) = std::env::var("TILEHUB_NO_DELAY") {
            if let Ok(no_delay) = value.parse() {
                self.no_delay = no_delay;
            }
        }
        if let Ok(value) = std::env::var("TILEHUB_SEND_BUFFER_SIZE") {
            if let Ok(size) = value.parse() {
                self.send_buffer_size = Some(size);
            }
        }
        if let Ok(value) = std::env::var("TILEHUB_RECV_BUFFER_SIZE") {
            if let Ok(size) = value.parse() {
                self.recv_buffer_size = Some(size);
            }
        }
    }
}
