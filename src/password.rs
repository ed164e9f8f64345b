//! Adaptive password hashing (Argon2id).
//!
//! Hashing and verification are CPU bound and run on the blocking pool.

use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher as _, PasswordVerifier as _,
};
use async_trait::async_trait;
use rand::rngs::OsRng;
use std::sync::Arc;

#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, password: &str) -> Result<String>;

    /// Check `password` against `hash`. With no hash (unknown account) the
    /// work is still done against a dummy, so both cases cost the same.
    async fn verify(&self, password: &str, hash: Option<&str>) -> Result<bool>;
}

#[derive(Clone)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
    dummy: Arc<str>,
}

impl Argon2Hasher {
    /// # Errors
    /// Returns an error if the dummy hash cannot be computed.
    pub fn new() -> Result<Self> {
        Self::with_params(argon2::Params::default())
    }

    /// # Errors
    /// Returns an error if the dummy hash cannot be computed.
    pub fn with_params(params: argon2::Params) -> Result<Self> {
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
        let dummy = hash_with(&argon2, "not-a-real-password")?;
        Ok(Self {
            argon2,
            dummy: Arc::from(dummy),
        })
    }
}

fn hash_with(argon2: &Argon2<'_>, password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?
        .to_string())
}

#[async_trait]
impl PasswordHasher for Argon2Hasher {
    async fn hash(&self, password: &str) -> Result<String> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hash_with(&argon2, &password))
            .await
            .context("password hashing task failed")?
    }

    async fn verify(&self, password: &str, hash: Option<&str>) -> Result<bool> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        let known = hash.is_some();
        let hash = hash.map_or_else(|| self.dummy.to_string(), str::to_string);
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&hash)
                .map_err(|err| anyhow!("stored password hash is malformed: {err}"))?;
            Ok(known && argon2.verify_password(password.as_bytes(), &parsed).is_ok())
        })
        .await
        .context("password verification task failed")?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Cheap parameters; production uses the library defaults.
    pub(crate) fn fast_hasher() -> Result<Argon2Hasher> {
        let params = argon2::Params::new(1024, 1, 1, None)
            .map_err(|err| anyhow!("invalid argon2 params: {err}"))?;
        Argon2Hasher::with_params(params)
    }

    #[tokio::test]
    async fn verifies_only_the_right_password() -> Result<()> {
        let hasher = fast_hasher()?;
        let hash = hasher.hash("Password1!").await?;
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("Password1!", Some(&hash)).await?);
        assert!(!hasher.verify("password1!", Some(&hash)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_account_never_verifies() -> Result<()> {
        let hasher = fast_hasher()?;
        assert!(!hasher.verify("not-a-real-password", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_hash_is_an_error() -> Result<()> {
        let hasher = fast_hasher()?;
        assert!(hasher.verify("x", Some("plaintext")).await.is_err());
        Ok(())
    }
}
