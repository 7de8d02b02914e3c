//! # Control Messages and Stream Headers
//!
//! All typed payloads exchanged between the client and the server. Control
//! messages travel inside an [`Envelope`] whose `payload` is a JSON value
//! keyed by the envelope `type`; proxied streams are prefixed by exactly one
//! [`StreamHeader`].

use crate::error::{ErrorCode, ProtocolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current protocol version. Incompatible wire changes increment this and
/// optionally raise [`MIN_SUPPORTED_VERSION`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version this build still speaks.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Returns true when `version` falls inside the supported range.
pub fn is_version_supported(version: u32) -> bool {
    (MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION).contains(&version)
}

/// Subdomain admission predicate: `^[a-z][a-z0-9-]{2,62}$`.
///
/// Callers are expected to lowercase first; mixed case is normalised at the
/// registry, never rejected outright.
pub fn is_valid_subdomain(s: &str) -> bool {
    let bytes = s.as_bytes();
    if !(3..=63).contains(&bytes.len()) {
        return false;
    }
    if !bytes[0].is_ascii_lowercase() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─── Envelope ───────────────────────────────────────────────────

/// All control message types. Serialized as snake_case strings in the
/// envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    HandshakeResponse,
    AddTunnel,
    RemoveTunnel,
    TunnelUpdate,
    Ping,
    Pong,
    Shutdown,
    Error,
}

/// The framed control message: a type tag, an informational wall-clock
/// timestamp (UTC milliseconds), an optional correlation id and an opaque
/// payload whose schema is keyed by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// A payload-less envelope (ping, pong).
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            timestamp: unix_millis(),
            request_id: String::new(),
            payload: serde_json::Value::Null,
        }
    }

    /// An envelope carrying a typed payload.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            timestamp: unix_millis(),
            request_id: String::new(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Decodes the payload as the type implied by the envelope kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::InvalidMessage(format!("bad {:?} payload: {e}", self.kind)))
    }
}

// ─── Handshake ──────────────────────────────────────────────────

/// First message on the first stream of every new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub version: u32,
    pub token: String,
    #[serde(default)]
    pub client_id: String,
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl HandshakeRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.version < MIN_SUPPORTED_VERSION {
            return Err(ProtocolError::Validation(format!(
                "protocol version {} below minimum supported {}",
                self.version, MIN_SUPPORTED_VERSION
            )));
        }
        if self.token.is_empty() {
            return Err(ProtocolError::Validation("missing authentication token".into()));
        }
        if self.tunnels.is_empty() {
            return Err(ProtocolError::Validation("at least one tunnel is required".into()));
        }
        for tunnel in &self.tunnels {
            tunnel.validate()?;
        }
        Ok(())
    }
}

/// Server reply to a [`HandshakeRequest`].
///
/// `success` is true whenever at least one tunnel registered; callers must
/// inspect the per-tunnel statuses, which are positionally aligned with the
/// request's tunnel list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default)]
    pub tunnels: Vec<TunnelStatus>,
    pub server_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

// ─── Tunnels ────────────────────────────────────────────────────

/// One requested subdomain → local target binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub subdomain: String,
    pub local_port: u16,
    #[serde(default)]
    pub local_host: String,
    #[serde(default)]
    pub protocol: String,
}

impl TunnelConfig {
    /// Syntactic checks only; the registry is the admission authority for
    /// subdomain format and reservations.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.subdomain.trim().is_empty() {
            return Err(ProtocolError::Validation("tunnel subdomain is required".into()));
        }
        if self.local_port == 0 {
            return Err(ProtocolError::Validation("tunnel local_port must be 1..65535".into()));
        }
        match self.protocol.as_str() {
            "" | "http" | "tcp" => Ok(()),
            other => Err(ProtocolError::Validation(format!(
                "unsupported tunnel protocol {other:?}"
            ))),
        }
    }

    /// Protocol with the default applied.
    pub fn protocol_or_default(&self) -> &str {
        if self.protocol.is_empty() {
            "http"
        } else {
            &self.protocol
        }
    }

    /// Local host with the default applied.
    pub fn local_host_or_default(&self) -> &str {
        if self.local_host.is_empty() {
            "127.0.0.1"
        } else {
            &self.local_host
        }
    }

    /// A copy with the subdomain lowercased and defaults filled in.
    pub fn normalized(&self) -> TunnelConfig {
        TunnelConfig {
            subdomain: self.subdomain.trim().to_ascii_lowercase(),
            local_port: self.local_port,
            local_host: self.local_host_or_default().to_owned(),
            protocol: self.protocol_or_default().to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Active,
    Pending,
    Error,
}

/// Registration outcome for one tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub subdomain: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_url: String,
    pub status: TunnelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Control payloads ───────────────────────────────────────────

/// Payload of an `add_tunnel` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTunnel {
    pub tunnels: Vec<TunnelConfig>,
}

/// Payload of a `remove_tunnel` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveTunnel {
    pub subdomain: String,
}

/// Payload of a `tunnel_update` envelope: the current per-tunnel statuses
/// after a mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelUpdate {
    pub tunnels: Vec<TunnelStatus>,
}

/// Payload of a `shutdown` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shutdown {
    pub reason: String,
    pub grace_period_ms: u64,
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

// ─── Stream header ──────────────────────────────────────────────

/// Kind of traffic carried by a server-opened stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Http,
    Tcp,
    Websocket,
}

/// Sent exactly once at the start of every server-opened proxy stream;
/// identifies the target tunnel and the originating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHeader {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub local_port: u16,
    #[serde(default)]
    pub local_host: String,
    pub request_id: String,
    pub subdomain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl StreamHeader {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.local_port == 0 {
            return Err(ProtocolError::Validation("stream header local_port must be 1..65535".into()));
        }
        if self.request_id.is_empty() {
            return Err(ProtocolError::Validation("stream header request_id is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_window() {
        assert!(is_version_supported(PROTOCOL_VERSION));
        assert!(is_version_supported(MIN_SUPPORTED_VERSION));
        assert!(!is_version_supported(0));
        assert!(!is_version_supported(PROTOCOL_VERSION + 1));
    }

    #[test]
    fn subdomain_admission_boundaries() {
        assert!(!is_valid_subdomain("ab"), "length 2 rejected");
        assert!(is_valid_subdomain("abc"), "length 3 accepted");
        assert!(is_valid_subdomain(&format!("a{}", "b".repeat(62))), "length 63 accepted");
        assert!(!is_valid_subdomain(&format!("a{}", "b".repeat(63))), "length 64 rejected");
        assert!(!is_valid_subdomain("1abc"), "must start with a letter");
        assert!(!is_valid_subdomain("Abc"), "uppercase is normalised before admission");
        assert!(is_valid_subdomain("api-v2"));
        assert!(is_valid_subdomain("abc-"), "trailing hyphen admitted by the predicate");
        assert!(!is_valid_subdomain("a_b"));
    }

    #[test]
    fn tunnel_config_validation() {
        let mut cfg = TunnelConfig {
            subdomain: "api".into(),
            local_port: 1,
            local_host: String::new(),
            protocol: String::new(),
        };
        cfg.validate().unwrap();
        cfg.local_port = 65535;
        cfg.validate().unwrap();
        cfg.local_port = 0;
        assert!(cfg.validate().is_err());

        cfg.local_port = 3000;
        cfg.protocol = "udp".into();
        assert!(cfg.validate().is_err());
        cfg.protocol.clear();
        assert_eq!(cfg.protocol_or_default(), "http");
        assert_eq!(cfg.local_host_or_default(), "127.0.0.1");

        // 65,536 is unrepresentable: the u16 port rejects it at decode time.
        let oversized: Result<TunnelConfig, _> =
            serde_json::from_str(r#"{"subdomain":"api","local_port":65536}"#);
        assert!(oversized.is_err());
    }

    #[test]
    fn handshake_requires_token_and_tunnels() {
        let mut req = HandshakeRequest {
            version: PROTOCOL_VERSION,
            token: "secret".into(),
            client_id: "dev".into(),
            tunnels: vec![TunnelConfig {
                subdomain: "api".into(),
                local_port: 3000,
                local_host: String::new(),
                protocol: String::new(),
            }],
            capabilities: vec![],
        };
        req.validate().unwrap();

        req.token.clear();
        assert!(req.validate().is_err());
        req.token = "secret".into();
        req.tunnels.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn stream_header_validation() {
        let mut header = StreamHeader {
            kind: StreamKind::Http,
            local_port: 3000,
            local_host: "127.0.0.1".into(),
            request_id: "r-1".into(),
            subdomain: "api".into(),
            remote_addr: None,
            host: None,
            method: None,
            path: None,
        };
        header.validate().unwrap();
        header.request_id.clear();
        assert!(header.validate().is_err());
        header.request_id = "r-1".into();
        header.local_port = 0;
        assert!(header.validate().is_err());
    }

    #[test]
    fn envelope_round_trips_payload() {
        let req = RemoveTunnel { subdomain: "api".into() };
        let env = Envelope::with_payload(MessageType::RemoveTunnel, &req)
            .unwrap()
            .with_request_id("req-7");
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.kind, MessageType::RemoveTunnel);
        assert_eq!(back.request_id, "req-7");
        let payload: RemoveTunnel = back.payload_as().unwrap();
        assert_eq!(payload.subdomain, "api");
    }
}
