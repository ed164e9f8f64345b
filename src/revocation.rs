//! Access token denylist keyed by `jti`.
//!
//! Entries expire on their own once the credential they revoke would have
//! expired anyway, so the list stays bounded by the number of live tokens.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::store::FastStore;

const KEY_PREFIX: &str = "jti:";

/// Anything that can revoke a token id for a while.
#[async_trait]
pub trait Revoker: Send + Sync {
    async fn revoke(&self, jti: &str, ttl: Duration) -> Result<()>;
}

#[async_trait]
pub trait RevocationStore: Revoker {
    async fn is_revoked(&self, jti: &str) -> Result<bool>;
}

/// Denylist kept in the shared fast store, visible to every instance.
pub struct SharedRevocationStore {
    store: Arc<dyn FastStore>,
}

impl SharedRevocationStore {
    #[must_use]
    pub fn new(store: Arc<dyn FastStore>) -> Self {
        Self { store }
    }
}

fn key(jti: &str) -> String {
    format!("{KEY_PREFIX}{jti}")
}

#[async_trait]
impl Revoker for SharedRevocationStore {
    async fn revoke(&self, jti: &str, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            // Already expired; verification rejects it without our help.
            return Ok(());
        }
        self.store
            .set_with_expiry(&key(jti), ttl)
            .await
            .map_err(Error::Transient)
    }
}

#[async_trait]
impl RevocationStore for SharedRevocationStore {
    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        let ttl = self
            .store
            .time_to_live(&key(jti))
            .await
            .map_err(Error::Transient)?;
        Ok(ttl.is_some_and(|ttl| !ttl.is_zero()))
    }
}
