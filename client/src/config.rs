//! # Client Configuration

use crate::pool::PoolConfig;
use crate::reconnect::ReconnectConfig;
use burrow_protocol::TunnelConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `tcp://host:port`, or `ws://host/_tunnel` (`wss://` for TLS) when the
    /// server's control plane is only reachable as an HTTP upgrade.
    pub server_addr: String,
    pub token: String,
    pub client_id: String,
    pub tunnels: Vec<TunnelConfig>,
    pub reconnect: ReconnectConfig,
    pub pool: PoolConfig,
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "tcp://127.0.0.1:7070".into(),
            token: String::new(),
            client_id: String::new(),
            tunnels: Vec::new(),
            reconnect: ReconnectConfig::default(),
            pool: PoolConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl ClientConfig {
    /// Loads a JSON config file, or the defaults when `path` is `None`.
    pub fn load(path: Option<impl AsRef<Path>>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path.as_ref())?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }
}
