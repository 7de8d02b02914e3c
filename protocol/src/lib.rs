//! # Burrow Wire Protocol
//!
//! Shared wire layer for the burrow tunnel server and client:
//!
//! - [`messages`] — control envelopes, handshake payloads and stream headers
//!   (JSON-serialized)
//! - [`codec`]    — length-prefixed framing for envelopes and stream headers
//! - [`mux`]      — stream multiplexer carrying many independent byte
//!   streams over one connection
//!
//! ## Wire layout
//!
//! ```text
//! TCP / WebSocket connection
//!   └─ multiplexer frames (OPEN / DATA / WINDOW / EOF / RESET / PING / PONG)
//!        └─ stream 1: handshake envelopes   [u32 BE length][JSON]
//!        └─ stream N: proxied request bytes, prefixed by one stream header
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod mux;

pub use error::{ErrorCode, ProtocolError};
pub use messages::{
    is_valid_subdomain, is_version_supported, AddTunnel, Envelope, ErrorMessage, HandshakeRequest,
    HandshakeResponse, MessageType, RemoveTunnel, Shutdown, StreamHeader, StreamKind, TunnelConfig,
    TunnelState, TunnelStatus, TunnelUpdate, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION,
};
pub use mux::{MuxConfig, MuxError, MuxStream, Multiplexer, Role};
