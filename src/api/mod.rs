use anyhow::Result;
use axum::{
    body::Body,
    extract::{Extension, MatchedPath},
    http::{HeaderName, HeaderValue, Request},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer, request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;

pub mod handlers;
pub mod middleware;
pub mod principal;
mod state;
pub mod sweeper;

pub use state::{AppState, AuthConfig, Limiters};

use crate::error::internal_error_response;
use handlers::{admin, auth, health};

/// Build the application router.
///
/// Every route passes the local client bucket. Auth routes then share the
/// auth window budget and the admin routes the global one.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let auth_routes = Router::new()
        .route("/v1/auth/register", post(auth::register))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route("/v1/auth/logout", post(auth::logout))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth_limit));

    let admin_routes = Router::new()
        .route(admin::REVOKE_PATH, post(admin::revoke_token))
        .route_layer(from_fn_with_state(state.clone(), middleware::global_limit));

    Router::new()
        .route("/health", get(health::health))
        .merge(auth_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(CatchPanicLayer::custom(handle_panic))
                .layer(Extension(state.clone()))
                .layer(from_fn_with_state(state, middleware::client_limit)),
        )
}

/// Serve until ctrl-c.
/// # Errors
/// Return error if the listener cannot be bound or the server fails
pub async fn serve(port: u16, state: Arc<AppState>) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> axum::response::Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    error!(panic = detail, "request handler panicked");
    internal_error_response()
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
