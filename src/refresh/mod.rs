//! Refresh token ledger.
//!
//! Refresh tokens are opaque random strings. Only their SHA-256 hash is
//! stored. A token can be consumed exactly once: consuming it marks it used
//! and mints its successor in the same atomic unit. Presenting a used token
//! again is treated as theft, and every live token of that subject is dropped.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use memory::MemoryRefreshLedger;
pub use postgres::PgRefreshLedger;

const TOKEN_BYTES: usize = 32;

/// Outcome of presenting a refresh token that exists and has not expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// First use: the token is now spent and `token` replaces it.
    Rotated { subject: Uuid, token: String },
    /// The token had already been spent. No new token is minted and every
    /// other live token of `subject` has been invalidated.
    Reused { subject: Uuid },
}

#[async_trait]
pub trait RefreshLedger: Send + Sync {
    /// Mint a new token for `subject`.
    async fn issue(&self, subject: Uuid, expires_at: DateTime<Utc>) -> Result<String>;

    /// Consume `token` and mint its successor.
    ///
    /// Missing and expired tokens both yield [`Error::Unauthorized`].
    /// Concurrent calls with the same token are linearized: at most one sees
    /// [`Rotation::Rotated`].
    async fn use_and_rotate(&self, token: &str, new_expires_at: DateTime<Utc>) -> Result<Rotation>;

    /// Drop `token`. Unknown tokens are ignored.
    async fn revoke(&self, token: &str) -> Result<()>;

    /// Delete expired rows, returning how many went away.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Fresh opaque token with 256 bits of entropy.
///
/// # Errors
/// Returns [`Error::Transient`] if the OS RNG fails.
pub fn new_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| Error::Transient(anyhow::anyhow!("refresh token rng failed: {err}")))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

#[must_use]
pub fn hash_token(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}
