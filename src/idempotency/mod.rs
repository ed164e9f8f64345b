//! Idempotency keys for mutating requests.
//!
//! A client tags a request with an `Idempotency-Key` header. The first
//! request with a given (key, subject) pair claims it, runs the mutation and
//! stores the response. Repeats with the same body replay that response.
//! Repeats with a different body are rejected, and repeats that arrive while
//! the first is still running are told to come back later. The ledger is
//! never locked while the mutation itself runs; `claim` and `complete`
//! bracket it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::CONTENT_TYPE, request::Parts, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

pub use memory::MemoryIdempotencyLedger;
pub use postgres::PgIdempotencyLedger;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const MAX_KEY_LEN: usize = 255;

/// One attempt at an idempotent mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRequest {
    pub key: String,
    pub subject: Uuid,
    pub method: String,
    pub path: String,
    pub body_hash: Vec<u8>,
}

impl IdempotencyRequest {
    #[must_use]
    pub fn new(key: String, subject: Uuid, method: &Method, path: &str, body: &[u8]) -> Self {
        Self {
            key,
            subject,
            method: method.as_str().to_string(),
            path: path.to_string(),
            body_hash: Sha256::digest(body).to_vec(),
        }
    }
}

/// Response persisted for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: String,
}

impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        (
            status,
            [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            self.body,
        )
            .into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// No earlier attempt; run the mutation.
    Fresh,
    /// A completed earlier attempt; return this instead of running again.
    Replay(StoredResponse),
}

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Claim the request's (key, subject) pair.
    ///
    /// # Errors
    /// [`Error::BodyMismatch`] when the key was used with another body,
    /// [`Error::InProgress`] when an identical request has not completed,
    /// [`Error::Transient`] when the store is unavailable.
    async fn claim(&self, request: &IdempotencyRequest) -> Result<Claim>;

    /// Store the response. Only the first completion is kept.
    async fn complete(&self, key: &str, subject: Uuid, response: &StoredResponse) -> Result<()>;

    /// Drop an uncompleted claim so the request can be retried.
    async fn release(&self, key: &str, subject: Uuid) -> Result<()>;

    /// Delete records claimed before `cutoff`.
    async fn purge_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Run `mutation` at most once per idempotency key.
///
/// Without a request the mutation simply runs. A mutation rejected before it
/// changed anything releases its claim, so a corrected retry runs again. A
/// transient failure may have landed after the effect committed; that claim
/// stays in flight and retries see `InProgress` until retention purges it.
///
/// # Errors
/// Returns claim errors and the mutation's own error.
pub async fn run_idempotent<F, Fut>(
    ledger: &dyn IdempotencyLedger,
    request: Option<&IdempotencyRequest>,
    mutation: F,
) -> Result<StoredResponse>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<StoredResponse>> + Send,
{
    let Some(request) = request else {
        return mutation().await;
    };

    if let Claim::Replay(stored) = ledger.claim(request).await? {
        debug!(
            key = %request.key,
            method = %request.method,
            path = %request.path,
            "replaying stored response"
        );
        return Ok(stored);
    }

    match mutation().await {
        Ok(response) => {
            // The mutation has happened; a lost completion only costs the
            // client an `InProgress` on retry.
            if let Err(err) = ledger
                .complete(&request.key, request.subject, &response)
                .await
            {
                error!(key = %request.key, "failed to record idempotent response: {err:#}");
            }
            Ok(response)
        }
        Err(err) if leaves_no_effect(&err) => {
            if let Err(release_err) = ledger.release(&request.key, request.subject).await {
                warn!(key = %request.key, "failed to release idempotency claim: {release_err:#}");
            }
            Err(err)
        }
        Err(err) => {
            warn!(key = %request.key, "mutation outcome unknown, keeping idempotency claim");
            Err(err)
        }
    }
}

/// Rejections a mutation reports before it has changed anything.
const fn leaves_no_effect(err: &Error) -> bool {
    matches!(
        err,
        Error::Unauthorized
            | Error::TokenReused
            | Error::BodyMismatch
            | Error::InProgress
            | Error::RateLimited { .. }
            | Error::Forbidden
            | Error::BadRequest(_)
            | Error::Conflict
    )
}

/// The optional `Idempotency-Key` request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub Option<String>);

impl IdempotencyKey {
    /// Pair the key with the request it guards.
    #[must_use]
    pub fn request(
        &self,
        subject: Uuid,
        method: &Method,
        path: &str,
        body: &[u8],
    ) -> Option<IdempotencyRequest> {
        self.0
            .clone()
            .map(|key| IdempotencyRequest::new(key, subject, method, path, body))
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(IDEMPOTENCY_KEY_HEADER) else {
            return Ok(Self(None));
        };
        let key = value
            .to_str()
            .map_err(|_| Error::BadRequest("idempotency key must be visible ASCII".to_string()))?
            .trim();
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::BadRequest(format!(
                "idempotency key must be 1 to {MAX_KEY_LEN} characters"
            )));
        }
        Ok(Self(Some(key.to_string())))
    }
}
