//! Node configuration file handling.
//!
//! A node reads an optional TOML file; command-line flags override
//! whatever the file sets, and built-in defaults cover the rest.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Node configuration, merged under the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Listen address for `serve`
    pub listen: SocketAddr,
    /// Remote address for `connect`
    pub addr: SocketAddr,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: f64,
    /// Token peers must present as their first handshake parameter;
    /// unset accepts everyone
    pub auth_token: Option<String>,
    /// Handshake parameters presented by `connect`
    pub params: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4600)),
            addr: SocketAddr::from(([127, 0, 0, 1], 4600)),
            heartbeat_interval_secs: 1.0,
            auth_token: None,
            params: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, or defaults when no file was given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Heartbeat interval as a duration; nonsense values fall back to 1s.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.heartbeat_interval_secs)
            .unwrap_or(Duration::from_secs(1))
    }
}
