//! # Burrow Client
//!
//! Keeps one outbound multiplexed connection to a burrow server, registers
//! tunnels over it and serves every server-opened stream by piping it to a
//! pooled local connection.
//!
//! ## Modules
//!
//! - [`dispatcher`] — connect, handshake, accept loop, per-stream workers
//! - [`pool`]       — per-local-port pooled connections with reaping
//! - [`reconnect`]  — exponential backoff with jitter
//! - [`observer`]   — state-change and request callbacks
//! - [`transport`]  — TCP / WebSocket connect helpers
//! - [`config`]     — deserializable client configuration

pub mod config;
pub mod dispatcher;
pub mod observer;
pub mod pool;
pub mod reconnect;
pub mod transport;
