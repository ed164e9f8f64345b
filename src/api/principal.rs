//! Bearer token authentication.

use anyhow::anyhow;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::AppState;
use crate::error::{Error, Result};
use crate::keys::AccessClaims;
use crate::users::Role;

/// Caller authenticated by a valid, unrevoked access token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub claims: AccessClaims,
    /// Clock reading the token was checked against.
    pub verified_at: DateTime<Utc>,
}

impl Principal {
    /// # Errors
    /// Returns [`Error::Forbidden`] unless the principal holds `role`.
    pub async fn require_role(&self, state: &AppState, role: Role) -> Result<()> {
        if state.users.has_role(self.user_id, role).await? {
            Ok(())
        } else {
            Err(Error::Forbidden)
        }
    }
}

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let state = parts
            .extensions
            .get::<Arc<AppState>>()
            .cloned()
            .ok_or_else(|| Error::Transient(anyhow!("application state is not installed")))?;
        let token = bearer(parts).ok_or(Error::Unauthorized)?;

        let now = state.clock.now();
        let claims = state.tokens.verify(token, now)?;
        if state.revocations.is_revoked(&claims.jti).await? {
            return Err(Error::Unauthorized);
        }
        Ok(Self {
            user_id: claims.subject()?,
            claims,
            verified_at: now,
        })
    }
}
