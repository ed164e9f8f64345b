//! Rate limiting middleware.
//!
//! Order on every request: the local bucket (cheap, in process), then the
//! shared window for the route's scope. The local layer also resolves the
//! client address once and stores it as a [`ClientIp`] extension for the
//! layers and handlers behind it.
//!
//! The client address is the TCP peer. Forwarding headers are only read when
//! that peer is a configured trusted proxy; otherwise any caller could pick
//! its own limiter key or claim an allow-listed address.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::AppState;
use crate::error::Result;
use crate::limits::{AllowList, WindowLimiter};

/// Client address used as the rate-limit key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Client address as reported by a trusted proxy: the nearest
/// `X-Forwarded-For` hop outside `trusted`, else `X-Real-IP`.
fn forwarded_client(headers: &HeaderMap, trusted: &AllowList) -> Option<IpAddr> {
    if let Some(chain) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        let hops: Vec<IpAddr> = chain
            .split(',')
            .filter_map(|hop| hop.trim().parse().ok())
            .collect();
        return hops
            .iter()
            .rev()
            .find(|hop| !trusted.contains(**hop))
            .or_else(|| hops.first())
            .copied();
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Resolve the client behind `peer`.
pub(crate) fn resolve_client_ip(
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    trusted: &AllowList,
) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.contains(peer) {
        return Some(peer);
    }
    Some(forwarded_client(headers, trusted).unwrap_or(peer))
}

fn client_ip(request: &Request, trusted: &AllowList) -> String {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    resolve_client_ip(peer, request.headers(), trusted)
        .map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
}

/// Local token bucket per client address.
pub async fn client_limit(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let ip = client_ip(&request, &state.limits.trusted_proxies);
    state.limits.client.check(&ip).await.into_result()?;
    request.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(request).await)
}

async fn shared_limit(
    state: &AppState,
    limiter: &WindowLimiter,
    request: Request,
    next: Next,
) -> Result<Response> {
    let ip = request.extensions().get::<ClientIp>().map_or_else(
        || client_ip(&request, &state.limits.trusted_proxies),
        |ClientIp(ip)| ip.clone(),
    );
    if !state.limits.allow.contains_str(&ip) {
        limiter.check(&ip).await.into_result()?;
    }
    Ok(next.run(request).await)
}

/// Shared window for the auth routes.
pub async fn auth_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response> {
    shared_limit(&state, &state.limits.auth, request, next).await
}

/// Shared window for everything else.
pub async fn global_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response> {
    shared_limit(&state, &state.limits.global, request, next).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ip(value: &str) -> Option<IpAddr> {
        value.parse().ok()
    }

    fn proxies() -> anyhow::Result<AllowList> {
        AllowList::parse("10.0.0.0/8")
    }

    #[test]
    fn untrusted_peer_ignores_forwarding_headers() -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.2.3"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.1.2.4"));
        assert_eq!(
            resolve_client_ip(ip("198.51.100.7"), &headers, &proxies()?),
            ip("198.51.100.7")
        );
        assert_eq!(
            resolve_client_ip(ip("198.51.100.7"), &headers, &AllowList::default()),
            ip("198.51.100.7")
        );
        Ok(())
    }

    #[test]
    fn trusted_proxy_reports_nearest_untrusted_hop() -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 203.0.113.9, 10.0.0.2"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        // The left-most entry is whatever the client sent; only the hop the
        // proxy itself appended is believed.
        assert_eq!(
            resolve_client_ip(ip("10.0.0.1"), &headers, &proxies()?),
            ip("203.0.113.9")
        );
        Ok(())
    }

    #[test]
    fn trusted_proxy_falls_back_to_real_ip_then_peer() -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static(" 9.9.9.9 "));
        assert_eq!(
            resolve_client_ip(ip("10.0.0.1"), &headers, &proxies()?),
            ip("9.9.9.9")
        );
        assert_eq!(
            resolve_client_ip(ip("10.0.0.1"), &HeaderMap::new(), &proxies()?),
            ip("10.0.0.1")
        );
        Ok(())
    }

    #[test]
    fn no_peer_means_no_address() -> anyhow::Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        assert_eq!(resolve_client_ip(None, &headers, &proxies()?), None);
        Ok(())
    }
}
