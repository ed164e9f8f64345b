//! Error taxonomy shared by every core component.
//!
//! Components return [`Error`]; the HTTP layer renders it as a uniform JSON
//! envelope with a stable machine-readable `code`. Internal causes carried by
//! [`Error::Transient`] are logged but never rendered.

use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum Error {
    /// Any credential failure. Never says which check failed.
    #[error("unauthorized")]
    Unauthorized,
    #[error("refresh token reuse detected")]
    TokenReused,
    #[error("idempotency key reused with a different request body")]
    BodyMismatch,
    #[error("a request with this idempotency key is in progress")]
    InProgress,
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict")]
    Conflict,
    #[error("store unavailable")]
    Transient(#[source] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Stable code exposed to clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::TokenReused => "token_reused",
            Self::BodyMismatch => "body_mismatch",
            Self::InProgress => "in_progress",
            Self::RateLimited { .. } => "rate_limited",
            Self::Forbidden => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict => "conflict",
            Self::Transient(_) => "transient",
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::TokenReused => StatusCode::UNAUTHORIZED,
            Self::BodyMismatch | Self::InProgress | Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Safe to retry without changing the request.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InProgress | Self::RateLimited { .. } | Self::Transient(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::InProgress => Some(IN_PROGRESS_RETRY_AFTER),
            _ => None,
        }
    }

    fn message(&self) -> String {
        match self {
            // The cause stays in the logs.
            Self::Transient(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Transient(err.into())
    }
}

const IN_PROGRESS_RETRY_AFTER: Duration = Duration::from_secs(2);

/// Whole seconds for a `Retry-After` header, rounded up and never zero.
#[must_use]
pub fn retry_after_seconds(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Transient(cause) => error!(code = self.code(), "transient failure: {cause:#}"),
            Self::TokenReused => warn!(code = self.code(), "rejected reused refresh token"),
            _ => {}
        }

        let retry_after = self.retry_after().map(retry_after_seconds);
        let mut headers = HeaderMap::new();
        if let Some(seconds) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                headers.insert(RETRY_AFTER, value);
            }
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.message(),
            retry_after_seconds: retry_after,
        };
        (status, headers, Json(body)).into_response()
    }
}

/// Envelope for faults that escaped every handler (panics).
#[must_use]
pub fn internal_error_response() -> Response {
    let body = ErrorBody {
        code: "internal",
        message: "internal error".to_string(),
        retry_after_seconds: None,
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn retry_after_rounds_up_and_is_never_zero() {
        assert_eq!(retry_after_seconds(Duration::from_millis(0)), 1);
        assert_eq!(retry_after_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(retry_after_seconds(Duration::from_secs(60)), 60);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Unauthorized.code(), "unauthorized");
        assert_eq!(Error::TokenReused.code(), "token_reused");
        assert_eq!(Error::BodyMismatch.code(), "body_mismatch");
        assert_eq!(Error::InProgress.code(), "in_progress");
        assert_eq!(
            Error::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .code(),
            "rate_limited"
        );
        assert_eq!(Error::Transient(anyhow!("db down")).code(), "transient");
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::InProgress.is_retryable());
        assert!(Error::Transient(anyhow!("timeout")).is_retryable());
        assert!(!Error::BodyMismatch.is_retryable());
        assert!(!Error::TokenReused.is_retryable());
        assert!(!Error::Unauthorized.is_retryable());
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = Error::RateLimited {
            retry_after: Duration::from_millis(2500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Some("3")
        );
    }

    #[test]
    fn transient_response_hides_cause() {
        let response =
            Error::Transient(anyhow!("password=hunter2 connection refused")).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }
}
