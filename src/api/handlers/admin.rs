use axum::{
    body::Bytes,
    extract::Extension,
    http::{Method, StatusCode},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::types::{RevokeRequest, RevokeResponse};
use crate::api::{principal::Principal, AppState};
use crate::error::{Error, Result};
use crate::idempotency::{run_idempotent, IdempotencyKey, StoredResponse};
use crate::users::Role;

pub const REVOKE_PATH: &str = "/v1/admin/tokens/revoke";

/// Revoke an access token by `jti`. Honors `Idempotency-Key`.
pub async fn revoke_token(
    Extension(state): Extension<Arc<AppState>>,
    principal: Principal,
    idempotency_key: IdempotencyKey,
    body: Bytes,
) -> Result<StoredResponse> {
    principal.require_role(&state, Role::Admin).await?;

    let request = idempotency_key.request(principal.user_id, &Method::POST, REVOKE_PATH, &body);
    let (state_ref, admin_id, body_ref) = (&state, principal.user_id, &body);
    run_idempotent(state.idempotency.as_ref(), request.as_ref(), || async move {
        let request: RevokeRequest = serde_json::from_slice(body_ref)
            .map_err(|err| Error::BadRequest(format!("invalid revoke request: {err}")))?;
        let jti = request.jti.trim();
        if jti.is_empty() {
            return Err(Error::BadRequest("jti is required".to_string()));
        }
        let ttl = u64::try_from(request.ttl_seconds)
            .ok()
            .filter(|seconds| *seconds > 0)
            .map_or_else(|| state_ref.auth.admin_revoke_ttl(), Duration::from_secs);

        state_ref.revocations.revoke(jti, ttl).await?;
        info!(admin_id = %admin_id, jti, ttl_seconds = ttl.as_secs(), "access token revoked");

        let response = RevokeResponse {
            jti: jti.to_string(),
            ttl_seconds: ttl.as_secs(),
        };
        let body = serde_json::to_string(&response).map_err(|err| Error::Transient(err.into()))?;
        Ok(StoredResponse {
            status: StatusCode::OK.as_u16(),
            body,
        })
    })
    .await
}
