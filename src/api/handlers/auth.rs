//! Login, refresh, logout and registration.
//!
//! Flow Overview:
//! 1) Login checks the identity bucket and brute-force budget before any
//!    password work, then mints an access token and a refresh token.
//! 2) Refresh rotates the refresh token; presenting a spent one is reported
//!    as `token_reused` and ends every session of that user.
//! 3) Logout denylists the access token for its remaining lifetime and drops
//!    the refresh token if one is supplied.

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{
    json_body, CredentialsRequest, LogoutRequest, RefreshRequest, RegisterResponse, TokenResponse,
};
use crate::api::{middleware::ClientIp, principal::Principal, AppState};
use crate::clock;
use crate::error::{Error, Result};
use crate::refresh::Rotation;
use crate::users::{normalize_email, validate_credentials, Role};

fn token_response(
    state: &AppState,
    subject: Uuid,
    refresh_token: String,
    now: DateTime<Utc>,
) -> Result<TokenResponse> {
    let access = state.tokens.issue(subject, now)?;
    Ok(TokenResponse {
        access_token: access.token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: state.tokens.ttl().as_secs(),
    })
}

pub async fn login(
    Extension(state): Extension<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    payload: std::result::Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>> {
    let request = json_body(payload)?;
    let email = normalize_email(&request.email);
    if email.is_empty() || request.password.is_empty() {
        return Err(Error::BadRequest("email and password are required".to_string()));
    }

    state.limits.identity.check(&email).await.into_result()?;
    if !state.limits.allow.contains_str(&ip) {
        state.limits.brute.check(&ip, &email).await.into_result()?;
    }

    let user = state.users.find_by_email(&email).await?;
    let verified = state
        .passwords
        .verify(
            &request.password,
            user.as_ref().map(|user| user.password_hash.as_str()),
        )
        .await
        .map_err(Error::Transient)?;

    let Some(user) = user.filter(|_| verified) else {
        debug!(client_ip = %ip, "login failed");
        tokio::time::sleep(state.auth.failed_login_delay()).await;
        return Err(Error::Unauthorized);
    };

    let now = state.clock.now();
    let refresh_token = state
        .refresh
        .issue(user.id, clock::after(now, state.auth.refresh_ttl()))
        .await?;
    info!(user_id = %user.id, "login succeeded");
    Ok(Json(token_response(&state, user.id, refresh_token, now)?))
}

pub async fn refresh(
    Extension(state): Extension<Arc<AppState>>,
    payload: std::result::Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>> {
    let request = json_body(payload)?;
    let now = state.clock.now();
    let rotation = state
        .refresh
        .use_and_rotate(
            &request.refresh_token,
            clock::after(now, state.auth.refresh_ttl()),
        )
        .await?;

    match rotation {
        Rotation::Rotated { subject, token } => {
            Ok(Json(token_response(&state, subject, token, now)?))
        }
        Rotation::Reused { .. } => Err(Error::TokenReused),
    }
}

pub async fn logout(
    Extension(state): Extension<Arc<AppState>>,
    principal: Principal,
    payload: Option<Json<LogoutRequest>>,
) -> Result<StatusCode> {
    let ttl = state
        .tokens
        .revocation_ttl(&principal.claims, principal.verified_at);
    state.revocations.revoke(&principal.claims.jti, ttl).await?;

    if let Some(refresh_token) = payload
        .and_then(|Json(body)| body.refresh_token)
        .filter(|token| !token.is_empty())
    {
        state.refresh.revoke(&refresh_token).await?;
    }
    info!(user_id = %principal.user_id, "logged out");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn register(
    Extension(state): Extension<Arc<AppState>>,
    payload: std::result::Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let request = json_body(payload)?;
    let email = normalize_email(&request.email);
    validate_credentials(&email, &request.password)?;

    let hash = state
        .passwords
        .hash(&request.password)
        .await
        .map_err(Error::Transient)?;
    let id = state.users.create(&email, &hash).await?;
    state.users.assign_role(id, Role::User).await?;

    info!(user_id = %id, "user registered");
    Ok((StatusCode::CREATED, Json(RegisterResponse { id })))
}
