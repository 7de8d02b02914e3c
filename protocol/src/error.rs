//! Protocol-level errors and the machine-readable error codes carried in
//! `error` envelopes and handshake responses.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable error codes exchanged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    SubdomainTaken,
    SubdomainReserved,
    SubdomainInvalid,
    RateLimited,
    InternalError,
    ProtocolError,
    ConnectionLimit,
    TunnelLimitReached,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::SubdomainTaken => "SUBDOMAIN_TAKEN",
            ErrorCode::SubdomainReserved => "SUBDOMAIN_RESERVED",
            ErrorCode::SubdomainInvalid => "SUBDOMAIN_INVALID",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::ConnectionLimit => "CONNECTION_LIMIT",
            ErrorCode::TunnelLimitReached => "TUNNEL_LIMIT_REACHED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the framed codec and message validation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the connection at a frame boundary. This is the
    /// normal way a codec loop terminates.
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame or its payload could not be decoded, including EOF in the
    /// middle of a frame.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A frame exceeded the negotiated size limit, on either side.
    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// A message failed semantic validation before being sent or acted on.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
