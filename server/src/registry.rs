//! # Registry
//!
//! The subdomain ↔ session index. One readers/writer lock covers both maps
//! so registration can check collisions and insert atomically; a subdomain
//! is never mapped to more than one session.

use crate::auth::OwnerChecker;
use crate::session::Session;
use burrow_protocol::{
    is_valid_subdomain, ErrorCode, TunnelConfig, TunnelState, TunnelStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("subdomain does not match ^[a-z][a-z0-9-]{{2,62}}$")]
    SubdomainInvalid,
    #[error("subdomain is reserved")]
    SubdomainReserved,
    #[error("subdomain is already registered to another session")]
    SubdomainTaken,
    #[error("tunnel not found")]
    TunnelNotFound,
    #[error("tunnel belongs to another session")]
    Unauthorized,
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::SubdomainInvalid => ErrorCode::SubdomainInvalid,
            RegistryError::SubdomainReserved => ErrorCode::SubdomainReserved,
            RegistryError::SubdomainTaken => ErrorCode::SubdomainTaken,
            RegistryError::TunnelNotFound => ErrorCode::InternalError,
            RegistryError::Unauthorized => ErrorCode::Unauthorized,
        }
    }
}

/// One published subdomain.
#[derive(Clone)]
pub struct TunnelEntry {
    pub subdomain: String,
    pub local_port: u16,
    pub local_host: String,
    pub protocol: String,
    pub session: Arc<Session>,
}

#[derive(Default)]
struct Inner {
    tunnels: HashMap<String, TunnelEntry>,
    sessions: HashMap<String, Arc<Session>>,
}

pub struct Registry {
    inner: RwLock<Inner>,
    reserved: HashSet<String>,
    base_domain: String,
    https: bool,
    owner_checker: Option<Arc<dyn OwnerChecker>>,
}

impl Registry {
    pub fn new(base_domain: impl Into<String>, reserved: Vec<String>, https: bool) -> Self {
        let base_domain: String = base_domain.into();
        Self {
            inner: RwLock::new(Inner::default()),
            reserved: reserved.into_iter().map(|s| s.to_ascii_lowercase()).collect(),
            base_domain: base_domain.to_ascii_lowercase(),
            https,
            owner_checker: None,
        }
    }

    pub fn with_owner_checker(mut self, checker: Arc<dyn OwnerChecker>) -> Self {
        self.owner_checker = Some(checker);
        self
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    /// Normalises to lowercase, applies the admission regex and the
    /// reserved list. Returns the normalised subdomain.
    pub fn validate_subdomain(&self, subdomain: &str) -> Result<String, RegistryError> {
        let normalized = subdomain.trim().to_ascii_lowercase();
        if !is_valid_subdomain(&normalized) {
            return Err(RegistryError::SubdomainInvalid);
        }
        if self.reserved.contains(&normalized) {
            return Err(RegistryError::SubdomainReserved);
        }
        Ok(normalized)
    }

    /// Registers the session's tunnels, one status per requested tunnel in
    /// request order. Individual failures never abort the loop: other
    /// tunnels in the same handshake succeed independently.
    pub async fn register(
        &self,
        session: &Arc<Session>,
        tunnels: &[TunnelConfig],
    ) -> Vec<TunnelStatus> {
        // Owner lookups may hit a database; resolve them before taking the
        // exclusive lock.
        let mut owners: Vec<Option<String>> = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels {
            let subdomain = tunnel.subdomain.trim().to_ascii_lowercase();
            let owner = match &self.owner_checker {
                Some(checker) => match checker.get_subdomain_owner(&subdomain).await {
                    Ok(owner) => owner,
                    Err(error) => {
                        warn!(%subdomain, %error, "owner lookup failed");
                        None
                    }
                },
                None => None,
            };
            owners.push(owner);
        }

        let mut inner = self.inner.write().await;
        let mut statuses = Vec::with_capacity(tunnels.len());
        for (tunnel, owner) in tunnels.iter().zip(owners) {
            let config = tunnel.normalized();
            let subdomain = match self.validate_subdomain(&config.subdomain) {
                Ok(s) => s,
                Err(error) => {
                    statuses.push(error_status(&config, &error));
                    continue;
                }
            };
            if let Some(owner) = owner {
                if owner != session.token() {
                    statuses.push(error_status(&config, &RegistryError::SubdomainReserved));
                    continue;
                }
            }
            if let Some(existing) = inner.tunnels.get(&subdomain) {
                if existing.session.id() != session.id() {
                    statuses.push(error_status(&config, &RegistryError::SubdomainTaken));
                    continue;
                }
                debug!(%subdomain, session_id = %session.id(), "idempotent re-registration");
            }
            let public_url = self.build_url(&subdomain, config.protocol_or_default());
            inner.tunnels.insert(
                subdomain.clone(),
                TunnelEntry {
                    subdomain: subdomain.clone(),
                    local_port: config.local_port,
                    local_host: config.local_host.clone(),
                    protocol: config.protocol.clone(),
                    session: Arc::clone(session),
                },
            );
            session.register_tunnel(config.clone());
            info!(%subdomain, session_id = %session.id(), %public_url, "tunnel registered");
            statuses.push(TunnelStatus {
                subdomain,
                local_port: config.local_port,
                public_url,
                status: TunnelState::Active,
                error: None,
            });
        }
        inner
            .sessions
            .insert(session.id().to_owned(), Arc::clone(session));
        statuses
    }

    /// Removes the session and every tunnel it owns.
    pub async fn unregister(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        inner.tunnels.retain(|subdomain, entry| {
            if entry.session.id() == session_id {
                debug!(%subdomain, %session_id, "tunnel removed");
                false
            } else {
                true
            }
        });
        inner.sessions.remove(session_id);
    }

    /// Removes a single tunnel after an ownership check.
    pub async fn unregister_tunnel(
        &self,
        session_id: &str,
        subdomain: &str,
    ) -> Result<(), RegistryError> {
        let normalized = subdomain.trim().to_ascii_lowercase();
        let mut inner = self.inner.write().await;
        let entry = inner
            .tunnels
            .get(&normalized)
            .ok_or(RegistryError::TunnelNotFound)?;
        if entry.session.id() != session_id {
            return Err(RegistryError::Unauthorized);
        }
        let entry = inner.tunnels.remove(&normalized).expect("checked above");
        entry.session.unregister_tunnel(&normalized);
        info!(subdomain = %normalized, %session_id, "tunnel unregistered");
        Ok(())
    }

    /// Case-insensitive direct lookup.
    pub async fn lookup(&self, subdomain: &str) -> Option<TunnelEntry> {
        let normalized = subdomain.trim().to_ascii_lowercase();
        let inner = self.inner.read().await;
        inner.tunnels.get(&normalized).cloned()
    }

    /// Resolves a Host header: strips any port, lowercases and requires the
    /// `.base_domain` suffix before looking up the prefix.
    pub async fn lookup_by_host(&self, host: &str) -> Option<TunnelEntry> {
        let host = strip_port(host).to_ascii_lowercase();
        let suffix = format!(".{}", self.base_domain);
        let subdomain = host.strip_suffix(&suffix)?;
        self.lookup(subdomain).await
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        inner.sessions.get(session_id).cloned()
    }

    /// `(sessions, tunnels)` for the health endpoint.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.sessions.len(), inner.tunnels.len())
    }

    pub fn build_url(&self, subdomain: &str, protocol: &str) -> String {
        let scheme = match protocol {
            "tcp" => "tcp",
            _ if self.https => "https",
            _ => "http",
        };
        format!("{scheme}://{subdomain}.{}", self.base_domain)
    }
}

fn error_status(config: &TunnelConfig, error: &RegistryError) -> TunnelStatus {
    TunnelStatus {
        subdomain: config.subdomain.clone(),
        local_port: config.local_port,
        public_url: String::new(),
        status: TunnelState::Error,
        error: Some(error.code().to_string()),
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
