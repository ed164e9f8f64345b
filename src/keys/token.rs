//! HS256 access tokens (JWT compact form).
//!
//! Verification order: header, key resolution by `kid`, signature and
//! `iss`/`aud`, then the time claims against the caller's clock. Every failure
//! is logged at debug level with its precise reason and surfaced to callers as
//! [`Error::Unauthorized`].

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::debug;
use ulid::Ulid;
use uuid::Uuid;

use super::{KeyRing, SigningKey};
use crate::clock;
use crate::error::{Error, Result};

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    pub jti: String,
}

impl AccessClaims {
    /// Subject as a user id.
    ///
    /// # Errors
    /// Returns [`Error::Unauthorized`] when `sub` is not a UUID.
    pub fn subject(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| Error::Unauthorized)
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub kid: String,
    pub claims: AccessClaims,
}

/// Precise verification failures; never leave this module.
#[derive(Debug, ThisError)]
enum TokenError {
    #[error("invalid token header: {0}")]
    Header(jsonwebtoken::errors::Error),
    #[error("unsupported algorithm: {0:?}")]
    UnsupportedAlg(Algorithm),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("token has no kid and no fallback key is configured")]
    MissingKid,
    #[error("invalid signature")]
    Signature,
    #[error("invalid issuer")]
    Issuer,
    #[error("invalid audience")]
    Audience,
    #[error("issued in the future")]
    NotYetValid,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(jsonwebtoken::errors::Error),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => Self::Signature,
            ErrorKind::InvalidIssuer => Self::Issuer,
            ErrorKind::InvalidAudience => Self::Audience,
            ErrorKind::InvalidAlgorithm => Self::UnsupportedAlg(ALGORITHM),
            _ => Self::Invalid(err),
        }
    }
}

fn decoding_key(key: &SigningKey) -> DecodingKey {
    DecodingKey::from_secret(key.secret())
}

pub struct TokenIssuer {
    keys: Arc<KeyRing>,
    issuer: String,
    audience: String,
    ttl: Duration,
    leeway: Duration,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(keys: Arc<KeyRing>, issuer: String, audience: String, ttl: Duration) -> Self {
        Self {
            keys,
            issuer,
            audience,
            ttl,
            leeway: Duration::ZERO,
        }
    }

    /// Tolerated clock skew on both `iat` and `exp`. Zero unless configured.
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    fn leeway_secs(&self) -> i64 {
        i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = self.leeway.as_secs();
        // Time claims are checked against the injected clock in `verify_detailed`.
        validation.validate_exp = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation
    }

    /// Build fresh claims for `subject` and sign them with the current key.
    ///
    /// # Errors
    /// Returns [`Error::Transient`] if the claims cannot be encoded.
    pub fn issue(&self, subject: Uuid, now: DateTime<Utc>) -> Result<IssuedToken> {
        let iat = now.timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = AccessClaims {
            sub: subject.to_string(),
            iat,
            exp: iat.saturating_add(ttl),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Ulid::new().to_string(),
        };
        let (token, kid) = self.sign(&claims)?;
        Ok(IssuedToken { token, kid, claims })
    }

    /// Sign arbitrary claims with the current key; returns the token and the
    /// key id placed in its header.
    ///
    /// # Errors
    /// Returns [`Error::Transient`] if the claims cannot be encoded.
    pub fn sign(&self, claims: &AccessClaims) -> Result<(String, String)> {
        let key = self.keys.current();
        let mut header = Header::new(ALGORITHM);
        header.kid = Some(key.id().to_string());
        let token = encode(&header, claims, &EncodingKey::from_secret(key.secret()))
            .map_err(|e| Error::Transient(e.into()))?;
        Ok((token, key.id().to_string()))
    }

    /// Verify a token against the ring and return its claims.
    ///
    /// # Errors
    /// Returns [`Error::Unauthorized`] for every failure, whatever the cause.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims> {
        self.verify_detailed(token, now).map_err(|err| {
            debug!(reason = %err, "access token rejected");
            Error::Unauthorized
        })
    }

    /// How long a denylist entry must live so that `claims` never verify
    /// again: through the last whole second `verify` still accepts.
    #[must_use]
    pub fn revocation_ttl(&self, claims: &AccessClaims, now: DateTime<Utc>) -> Duration {
        let first_rejected = claims
            .exp
            .saturating_add(self.leeway_secs())
            .saturating_add(1);
        let deadline = Utc
            .timestamp_opt(first_rejected, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        clock::remaining(now, deadline)
    }

    fn verify_detailed(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, TokenError> {
        let header = decode_header(token).map_err(TokenError::Header)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let key = match header.kid.as_deref() {
            Some(kid) => self
                .keys
                .get(kid)
                .ok_or_else(|| TokenError::UnknownKid(kid.to_string()))?,
            None => self.keys.fallback().ok_or(TokenError::MissingKid)?,
        };

        let claims = decode::<AccessClaims>(token, &decoding_key(key), &self.validation())?.claims;

        let now = now.timestamp();
        let leeway = self.leeway_secs();
        if claims.iat > now.saturating_add(leeway) {
            return Err(TokenError::NotYetValid);
        }
        if now > claims.exp.saturating_add(leeway) {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}
