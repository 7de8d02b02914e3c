//! # Burrow Server
//!
//! The public endpoint of a burrow deployment. Clients keep one outbound
//! multiplexed connection here; the server publishes their tunnels as
//! subdomains of the base domain and bridges every inbound HTTP or
//! WebSocket request onto a fresh multiplexed stream.
//!
//! ## Modules
//!
//! - [`registry`] — subdomain ↔ session index
//! - [`session`]  — per-client connection handle, state and counters
//! - [`control`]  — accept loop, handshake, supervision, shutdown broadcast
//! - [`proxy`]    — public HTTP router (host/path/header routing, health)
//! - [`auth`]     — authenticator and subdomain-owner collaborators
//! - [`config`]   — deserializable server configuration

pub mod auth;
pub mod config;
pub mod control;
mod http;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod transport;
