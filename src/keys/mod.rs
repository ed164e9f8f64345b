//! Signing key ring.
//!
//! The ring is loaded once at startup and never mutated afterwards; rotating
//! keys means constructing a new ring. Signing always uses the designated
//! current key. Verification resolves the exact key named by the token's
//! `kid`; the only fallback is an explicitly configured key for tokens that
//! carry no `kid` at all.

pub mod token;

use anyhow::{anyhow, bail, Context, Result};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretSlice};
use std::collections::BTreeMap;
use std::fmt;

pub use token::{AccessClaims, IssuedToken, TokenIssuer};

/// Shortest secret accepted for HMAC-SHA256 signing.
pub const MIN_SECRET_LEN: usize = 32;

pub struct SigningKey {
    id: String,
    secret: SecretSlice<u8>,
}

impl SigningKey {
    /// # Errors
    /// Returns an error if the id is empty or the secret is shorter than [`MIN_SECRET_LEN`].
    pub fn new(id: impl Into<String>, secret: Vec<u8>) -> Result<Self> {
        let id = id.into();
        validate_kid(&id)?;
        if secret.len() < MIN_SECRET_LEN {
            bail!("signing key '{id}' must be at least {MIN_SECRET_LEN} bytes");
        }
        Ok(Self {
            id,
            secret: SecretSlice::from(secret),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn secret(&self) -> &[u8] {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn validate_kid(kid: &str) -> Result<()> {
    if kid.is_empty() || kid.len() > 64 {
        bail!("key id must be between 1 and 64 characters");
    }
    if !kid
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!("key id '{kid}' contains invalid characters");
    }
    Ok(())
}

#[derive(Debug)]
pub struct KeyRing {
    keys: BTreeMap<String, SigningKey>,
    current: String,
    fallback: Option<String>,
}

impl KeyRing {
    /// Build a ring from loaded keys.
    ///
    /// When `current` is not given the ring must hold exactly one key; picking
    /// one of several by map order would make signing depend on load order.
    ///
    /// # Errors
    /// Returns an error on duplicate ids, an empty ring, or an unknown
    /// current/fallback id.
    pub fn new(
        keys: Vec<SigningKey>,
        current: Option<&str>,
        fallback: Option<&str>,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for key in keys {
            let id = key.id.clone();
            if map.insert(id.clone(), key).is_some() {
                bail!("duplicate signing key id '{id}'");
            }
        }

        let current = match current {
            Some(kid) => kid.to_string(),
            None if map.len() == 1 => map
                .keys()
                .next()
                .cloned()
                .context("key ring is empty")?,
            None if map.is_empty() => bail!("key ring is empty"),
            None => bail!("several signing keys loaded; the current key id must be set"),
        };
        if !map.contains_key(&current) {
            bail!("current key id '{current}' is not in the key ring");
        }

        let fallback = fallback.map(ToString::to_string);
        if let Some(kid) = &fallback {
            if !map.contains_key(kid) {
                bail!("fallback key id '{kid}' is not in the key ring");
            }
        }

        Ok(Self {
            keys: map,
            current,
            fallback,
        })
    }

    /// Parse `kid:secret,kid:secret` as found in configuration.
    ///
    /// # Errors
    /// Returns an error if an entry is malformed or the ring is inconsistent.
    pub fn parse(list: &str, current: Option<&str>, fallback: Option<&str>) -> Result<Self> {
        let keys = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (kid, secret) = entry
                    .split_once(':')
                    .ok_or_else(|| anyhow!("signing key entry must be 'kid:secret'"))?;
                SigningKey::new(kid.trim(), secret.trim().as_bytes().to_vec())
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(keys, current, fallback)
    }

    /// The key used for every new signature.
    #[must_use]
    pub fn current(&self) -> &SigningKey {
        // `new` guarantees the current id is present.
        &self.keys[&self.current]
    }

    #[must_use]
    pub fn current_kid(&self) -> &str {
        &self.current
    }

    /// Exact lookup; there is no "first key" fallback.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.get(kid)
    }

    /// Key used for tokens without a `kid`, if one is configured.
    #[must_use]
    pub fn fallback(&self) -> Option<&SigningKey> {
        self.fallback.as_deref().and_then(|kid| self.keys.get(kid))
    }

    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// A new ring without `kid`, which stops verifying its tokens.
    ///
    /// # Errors
    /// Returns an error if `kid` is the current signing key or unknown.
    pub fn retire(mut self, kid: &str) -> Result<Self> {
        if kid == self.current {
            bail!("cannot retire the current signing key '{kid}'");
        }
        if self.keys.remove(kid).is_none() {
            bail!("unknown key id '{kid}'");
        }
        if self.fallback.as_deref() == Some(kid) {
            self.fallback = None;
        }
        Ok(self)
    }
}

/// Produce a `kid:hexsecret` line with a fresh 256-bit secret.
///
/// # Errors
/// Returns an error if the id is invalid or the OS RNG fails.
pub fn generate_key_line(kid: &str) -> Result<String> {
    validate_kid(kid)?;
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate signing secret")?;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("{kid}:{hex}"))
}
