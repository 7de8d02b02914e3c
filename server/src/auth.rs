//! # Authentication Collaborators
//!
//! The control plane consumes two capability sets: an [`Authenticator`]
//! validating client tokens and an [`OwnerChecker`] mapping subdomains to
//! owning identities. Both are trait objects so a no-op, a static-map and a
//! database-backed variant are interchangeable, and may be chained.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns whether the token is acceptable. Implementations iterating a
    /// token list must compare in constant time.
    async fn validate(&self, token: &str) -> anyhow::Result<bool>;

    /// Maps a token to a user identity, used for per-user limits and
    /// subdomain ownership.
    async fn get_user_id(&self, token: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait OwnerChecker: Send + Sync {
    /// Returns the identity owning `subdomain`, or `None` when unclaimed.
    async fn get_subdomain_owner(&self, subdomain: &str) -> anyhow::Result<Option<String>>;
}

/// Accepts every token; for development setups with `auth.mode = "none"`.
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn validate(&self, _token: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn get_user_id(&self, token: &str) -> anyhow::Result<String> {
        Ok(token.to_owned())
    }
}

/// Fixed token list, typically loaded from `auth.token_file`.
pub struct StaticTokenAuth {
    tokens: Vec<String>,
}

impl StaticTokenAuth {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Reads one token per line; blank lines and `#` comments are skipped.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut tokens = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            tokens.push(line.to_owned());
        }
        Ok(Self { tokens })
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn validate(&self, token: &str) -> anyhow::Result<bool> {
        // Fold over every candidate without short-circuiting so timing does
        // not reveal which tokens exist.
        let mut matched = subtle::Choice::from(0u8);
        for candidate in &self.tokens {
            matched |= candidate.as_bytes().ct_eq(token.as_bytes());
        }
        Ok(bool::from(matched))
    }

    async fn get_user_id(&self, token: &str) -> anyhow::Result<String> {
        if self.validate(token).await? {
            Ok(token.to_owned())
        } else {
            anyhow::bail!("unknown token")
        }
    }
}

/// Tries each authenticator in order; the first acceptance wins. Intended
/// shape: database first, static token file as fallback.
pub struct ChainAuthenticator {
    chain: Vec<Arc<dyn Authenticator>>,
}

impl ChainAuthenticator {
    pub fn new(chain: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl Authenticator for ChainAuthenticator {
    async fn validate(&self, token: &str) -> anyhow::Result<bool> {
        for authenticator in &self.chain {
            if authenticator.validate(token).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get_user_id(&self, token: &str) -> anyhow::Result<String> {
        for authenticator in &self.chain {
            if authenticator.validate(token).await? {
                return authenticator.get_user_id(token).await;
            }
        }
        anyhow::bail!("unknown token")
    }
}

/// Claims nothing; every subdomain is first come, first served.
pub struct NoOwnership;

#[async_trait]
impl OwnerChecker for NoOwnership {
    async fn get_subdomain_owner(&self, _subdomain: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Fixed subdomain → owner map.
pub struct StaticOwnerChecker {
    owners: HashMap<String, String>,
}

impl StaticOwnerChecker {
    pub fn new(owners: HashMap<String, String>) -> Self {
        Self { owners }
    }
}

#[async_trait]
impl OwnerChecker for StaticOwnerChecker {
    async fn get_subdomain_owner(&self, subdomain: &str) -> anyhow::Result<Option<String>> {
        Ok(self.owners.get(subdomain).cloned())
    }
}
