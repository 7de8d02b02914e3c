//! # Server Configuration
//!
//! Deserializable configuration for the public endpoint. Every field has a
//! default so a bare `{}` file (or no file at all) yields a working local
//! setup. Parsing richer formats and CLI flags is left to the deployment.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listener for client control connections.
    pub control_addr: String,
    /// Listener for the public HTTP proxy (also serves `/_tunnel` upgrades).
    pub http_addr: String,
    /// Reserved for a TLS-terminating listener; termination itself is
    /// expected from a fronting proxy when unset.
    pub https_addr: String,
    /// Base domain under which subdomains are published.
    pub domain: String,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
    pub limits: Limits,
    pub timeouts: Timeouts,
    pub reserved_subdomains: Vec<String>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:7070".into(),
            http_addr: "0.0.0.0:8080".into(),
            https_addr: String::new(),
            domain: "localhost".into(),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            reserved_subdomains: vec!["www".into(), "api".into(), "admin".into()],
            log_level: "info".into(),
        }
    }
}

impl ServerConfig {
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

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    pub auto_cert: bool,
    pub auto_cert_dir: String,
}

/// `mode` selects the authenticator: `token` reads a newline-separated
/// token file, `jwt` is accepted and resolved onto the token seam (the
/// verifier is an external collaborator), `none` disables auth.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: String,
    pub token_file: String,
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: "none".into(),
            token_file: String::new(),
            jwt_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_connections_per_user: usize,
    pub max_tunnels_per_connection: usize,
    pub max_requests_per_minute: u64,
    pub max_request_body_size: u64,
    pub max_bandwidth_bytes_per_sec: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections_per_user: 10,
            max_tunnels_per_connection: 16,
            max_requests_per_minute: 0,
            max_request_body_size: 64 * 1024 * 1024,
            max_bandwidth_bytes_per_sec: 0,
        }
    }
}

/// All durations in milliseconds on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 0,
            request_timeout_ms: 30_000,
            dial_timeout_ms: 10_000,
            write_timeout_ms: 30_000,
            read_timeout_ms: 30_000,
        }
    }
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Zero disables the idle check.
    pub fn idle(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
