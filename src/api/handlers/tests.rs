use anyhow::{anyhow, Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header::AUTHORIZATION, header::RETRY_AFTER, Request, StatusCode},
    Router,
};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use crate::api::{router, AppState, AuthConfig, Limiters};
use crate::clock::ManualClock;
use crate::idempotency::MemoryIdempotencyLedger;
use crate::keys::{KeyRing, TokenIssuer};
use crate::limits::{AllowList, BruteForceLimiter, TokenBucketLimiter, WindowLimiter};
use crate::password::tests::fast_hasher;
use crate::refresh::MemoryRefreshLedger;
use crate::revocation::SharedRevocationStore;
use crate::store::{FastStore, MemoryFastStore};
use crate::users::{MemoryUserStore, Role, UserStore};

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const EMAIL: &str = "a@b.c";
const PASSWORD: &str = "Password1!";

struct Harness {
    app: Router,
    clock: Arc<ManualClock>,
    users: Arc<MemoryUserStore>,
    peer: SocketAddr,
}

struct Options {
    brute_limit: u64,
    allow: &'static str,
    trusted_proxies: &'static str,
    peer: &'static str,
    leeway: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            brute_limit: 100,
            allow: "",
            trusted_proxies: "",
            peer: "203.0.113.9",
            leeway: Duration::ZERO,
        }
    }
}

fn harness(options: Options) -> Result<Harness> {
    let clock = Arc::new(ManualClock::new(
        Utc.timestamp_opt(1_700_000_000, 0)
            .single()
            .context("valid timestamp")?,
    ));
    let fast: Arc<dyn FastStore> = Arc::new(MemoryFastStore::new(clock.clone()));
    let keys = Arc::new(KeyRing::parse(&format!("k1:{SECRET}"), None, None)?);
    let users = Arc::new(MemoryUserStore::new());
    let window = Duration::from_secs(60);

    let state = AppState {
        clock: clock.clone(),
        tokens: TokenIssuer::new(
            keys,
            "warden".to_string(),
            "warden-api".to_string(),
            Duration::from_secs(900),
        )
        .with_leeway(options.leeway),
        refresh: Arc::new(MemoryRefreshLedger::new(clock.clone())),
        revocations: Arc::new(SharedRevocationStore::new(fast.clone())),
        idempotency: Arc::new(MemoryIdempotencyLedger::new(clock.clone())),
        users: users.clone(),
        passwords: Arc::new(fast_hasher()?),
        limits: Limiters {
            client: Arc::new(TokenBucketLimiter::new(1000.0, 1000, window)),
            identity: Arc::new(TokenBucketLimiter::new(1000.0, 1000, window)),
            global: WindowLimiter::new(fast.clone(), "rl:global", 1000, window),
            auth: WindowLimiter::new(fast.clone(), "rl:auth", 1000, window),
            brute: BruteForceLimiter::new(WindowLimiter::new(
                fast,
                "brute",
                options.brute_limit,
                Duration::from_secs(300),
            )),
            allow: AllowList::parse(options.allow)?,
            trusted_proxies: AllowList::parse(options.trusted_proxies)?,
        },
        auth: AuthConfig::new().with_failed_login_delay(Duration::ZERO),
        pool: None,
    };

    let peer: IpAddr = options.peer.parse()?;
    Ok(Harness {
        app: router(Arc::new(state)),
        clock,
        users,
        peer: SocketAddr::new(peer, 40_000),
    })
}

struct Reply {
    status: StatusCode,
    retry_after: Option<String>,
    request_id: bool,
    body: Value,
}

impl Harness {
    async fn call(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Result<Reply> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .extension(ConnectInfo(self.peer));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let request_id = response.headers().contains_key("x-request-id");
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(Reply {
            status,
            retry_after,
            request_id,
            body,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Reply> {
        self.call("POST", path, Some(body), &[]).await
    }

    async fn register(&self, email: &str) -> Result<uuid::Uuid> {
        let reply = self
            .post("/v1/auth/register", json!({"email": email, "password": PASSWORD}))
            .await?;
        assert_eq!(reply.status, StatusCode::CREATED);
        let id = reply.body["id"].as_str().context("id in register reply")?;
        Ok(id.parse()?)
    }

    async fn login(&self, email: &str, password: &str) -> Result<Reply> {
        self.post("/v1/auth/login", json!({"email": email, "password": password}))
            .await
    }

    async fn login_forwarded(
        &self,
        email: &str,
        password: &str,
        forwarded: &str,
    ) -> Result<Reply> {
        self.call(
            "POST",
            "/v1/auth/login",
            Some(json!({"email": email, "password": password})),
            &[("x-forwarded-for", forwarded)],
        )
        .await
    }

    async fn logout(&self, access: &str) -> Result<StatusCode> {
        let auth = bearer(access);
        let reply = self
            .call(
                "POST",
                "/v1/auth/logout",
                None,
                &[(AUTHORIZATION.as_str(), auth.as_str())],
            )
            .await?;
        Ok(reply.status)
    }

    async fn tokens(&self, email: &str) -> Result<(String, String)> {
        let reply = self.login(email, PASSWORD).await?;
        assert_eq!(reply.status, StatusCode::OK);
        Ok((
            reply.body["access_token"]
                .as_str()
                .context("access token")?
                .to_string(),
            reply.body["refresh_token"]
                .as_str()
                .context("refresh token")?
                .to_string(),
        ))
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn refresh_reuse_ends_the_session_family() -> Result<()> {
    let h = harness(Options::default())?;
    h.register(EMAIL).await?;
    let (_access, original) = h.tokens(EMAIL).await?;

    let first = h
        .post("/v1/auth/refresh", json!({"refresh_token": original}))
        .await?;
    assert_eq!(first.status, StatusCode::OK);
    let rotated = first.body["refresh_token"]
        .as_str()
        .context("rotated token")?
        .to_string();
    assert_ne!(rotated, original);
    assert_eq!(first.body["token_type"], "Bearer");
    assert_eq!(first.body["expires_in"], 900);

    let replay = h
        .post("/v1/auth/refresh", json!({"refresh_token": original}))
        .await?;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(replay.body["code"], "token_reused");

    let after = h
        .post("/v1/auth/refresh", json!({"refresh_token": rotated}))
        .await?;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
    assert_eq!(after.body["code"], "unauthorized");
    Ok(())
}

#[tokio::test]
async fn bad_credentials_are_indistinguishable() -> Result<()> {
    let h = harness(Options::default())?;
    h.register(EMAIL).await?;

    let wrong_password = h.login(EMAIL, "Password2!").await?;
    let unknown_user = h.login("nobody@b.c", PASSWORD).await?;
    for reply in [wrong_password, unknown_user] {
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(reply.body["code"], "unauthorized");
        assert_eq!(reply.body["message"], "unauthorized");
    }
    Ok(())
}

#[tokio::test]
async fn logout_revokes_access_and_refresh_tokens() -> Result<()> {
    let h = harness(Options::default())?;
    h.register(EMAIL).await?;
    let (access, refresh) = h.tokens(EMAIL).await?;
    let auth = bearer(&access);

    let reply = h
        .call(
            "POST",
            "/v1/auth/logout",
            Some(json!({"refresh_token": refresh})),
            &[(AUTHORIZATION.as_str(), auth.as_str())],
        )
        .await?;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);

    let again = h
        .call(
            "POST",
            "/v1/auth/logout",
            None,
            &[(AUTHORIZATION.as_str(), auth.as_str())],
        )
        .await?;
    assert_eq!(again.status, StatusCode::UNAUTHORIZED);

    let refresh = h
        .post("/v1/auth/refresh", json!({"refresh_token": refresh}))
        .await?;
    assert_eq!(refresh.body["code"], "unauthorized");
    Ok(())
}

#[tokio::test]
async fn expired_access_token_is_rejected() -> Result<()> {
    let h = harness(Options::default())?;
    h.register(EMAIL).await?;
    let (access, _) = h.tokens(EMAIL).await?;
    h.clock.advance(Duration::from_secs(901));

    let reply = h
        .call(
            "POST",
            "/v1/auth/logout",
            None,
            &[(AUTHORIZATION.as_str(), bearer(&access).as_str())],
        )
        .await?;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn logout_outlives_clock_skew_leeway() -> Result<()> {
    let h = harness(Options {
        leeway: Duration::from_secs(30),
        ..Options::default()
    })?;
    h.register(EMAIL).await?;
    let (access, _) = h.tokens(EMAIL).await?;

    h.clock.advance(Duration::from_secs(10));
    assert_eq!(h.logout(&access).await?, StatusCode::NO_CONTENT);

    // Still inside exp + leeway, so only the denylist keeps it out.
    h.clock.advance(Duration::from_secs(920));
    assert_eq!(h.logout(&access).await?, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn logout_covers_the_final_second() -> Result<()> {
    let h = harness(Options::default())?;
    h.register(EMAIL).await?;
    let (access, _) = h.tokens(EMAIL).await?;

    h.clock.advance(Duration::from_millis(899_500));
    assert_eq!(h.logout(&access).await?, StatusCode::NO_CONTENT);

    h.clock.advance(Duration::from_millis(1_200));
    assert_eq!(h.logout(&access).await?, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn forwarded_for_from_untrusted_peer_is_ignored() -> Result<()> {
    let h = harness(Options {
        brute_limit: 2,
        allow: "10.0.0.0/8",
        peer: "198.51.100.20",
        ..Options::default()
    })?;
    h.register(EMAIL).await?;

    let mut statuses = Vec::new();
    for hop in 0..6 {
        let forwarded = format!("10.1.2.{hop}");
        let reply = h.login_forwarded(EMAIL, "wrong-password", &forwarded).await?;
        statuses.push(reply.status);
    }
    assert_eq!(statuses[..2], [StatusCode::UNAUTHORIZED; 2]);
    assert_eq!(statuses[2..], [StatusCode::TOO_MANY_REQUESTS; 4]);
    Ok(())
}

#[tokio::test]
async fn trusted_proxy_forwards_the_client_address() -> Result<()> {
    let h = harness(Options {
        brute_limit: 1,
        allow: "203.0.113.0/24",
        trusted_proxies: "10.0.0.0/8",
        peer: "10.0.0.5",
        ..Options::default()
    })?;
    h.register(EMAIL).await?;

    for _ in 0..3 {
        let reply = h
            .login_forwarded(EMAIL, "wrong-password", "203.0.113.50")
            .await?;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }

    // A spoofed left-most entry does not hide the hop the proxy appended.
    let first = h
        .login_forwarded(EMAIL, "wrong-password", "203.0.113.50, 198.51.100.1")
        .await?;
    assert_eq!(first.status, StatusCode::UNAUTHORIZED);
    let second = h
        .login_forwarded(EMAIL, "wrong-password", "203.0.113.51, 198.51.100.1")
        .await?;
    assert_eq!(second.status, StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}

#[tokio::test]
async fn brute_force_limit_locks_out_with_retry_after() -> Result<()> {
    let h = harness(Options {
        brute_limit: 3,
        ..Options::default()
    })?;
    h.register(EMAIL).await?;

    for _ in 0..3 {
        let reply = h.login(EMAIL, "wrong-password").await?;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }
    let locked = h.login(EMAIL, PASSWORD).await?;
    assert_eq!(locked.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(locked.body["code"], "rate_limited");
    let retry_after: u64 = locked.retry_after.context("retry-after header")?.parse()?;
    assert!((1..=300).contains(&retry_after));
    Ok(())
}

#[tokio::test]
async fn allow_listed_clients_skip_the_brute_force_limit() -> Result<()> {
    let h = harness(Options {
        brute_limit: 1,
        allow: "203.0.113.0/24",
        ..Options::default()
    })?;
    h.register(EMAIL).await?;
    for _ in 0..3 {
        let reply = h.login(EMAIL, "wrong-password").await?;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    }
    assert_eq!(h.login(EMAIL, PASSWORD).await?.status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn registration_validates_and_rejects_duplicates() -> Result<()> {
    let h = harness(Options::default())?;
    h.register(EMAIL).await?;

    let duplicate = h
        .post("/v1/auth/register", json!({"email": "A@B.C", "password": PASSWORD}))
        .await?;
    assert_eq!(duplicate.status, StatusCode::CONFLICT);
    assert_eq!(duplicate.body["code"], "conflict");

    let invalid = h
        .post("/v1/auth/register", json!({"email": "nope", "password": PASSWORD}))
        .await?;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

    let malformed = h.post("/v1/auth/register", json!({"email": 1})).await?;
    assert_eq!(malformed.body["code"], "bad_request");
    Ok(())
}

#[tokio::test]
async fn admin_revoke_requires_role_and_replays() -> Result<()> {
    let h = harness(Options::default())?;
    let admin_id = h.register("admin@b.c").await?;
    h.register(EMAIL).await?;
    let (user_access, _) = h.tokens(EMAIL).await?;
    let (admin_access, _) = h.tokens("admin@b.c").await?;
    let user_auth = bearer(&user_access);
    let admin_auth = bearer(&admin_access);

    let victim_claims = {
        let payload = user_access.split('.').nth(1).context("claims segment")?;
        let bytes = Base64UrlUnpadded::decode_vec(payload)
            .map_err(|err| anyhow!("claims are not base64url: {err}"))?;
        serde_json::from_slice::<Value>(&bytes)?
    };
    let jti = victim_claims["jti"].as_str().context("jti claim")?.to_string();
    let body = json!({"jti": jti, "ttl_seconds": 0});

    let forbidden = h
        .call(
            "POST",
            "/v1/admin/tokens/revoke",
            Some(body.clone()),
            &[(AUTHORIZATION.as_str(), user_auth.as_str())],
        )
        .await?;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

    h.users.assign_role(admin_id, Role::Admin).await?;
    let headers = [
        (AUTHORIZATION.as_str(), admin_auth.as_str()),
        ("idempotency-key", "revoke-1"),
    ];
    let first = h
        .call("POST", "/v1/admin/tokens/revoke", Some(body.clone()), &headers)
        .await?;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["ttl_seconds"], 3600);

    let replay = h
        .call("POST", "/v1/admin/tokens/revoke", Some(body), &headers)
        .await?;
    assert_eq!(replay.status, StatusCode::OK);
    assert_eq!(replay.body, first.body);

    let mismatch = h
        .call(
            "POST",
            "/v1/admin/tokens/revoke",
            Some(json!({"jti": "other", "ttl_seconds": 60})),
            &headers,
        )
        .await?;
    assert_eq!(mismatch.status, StatusCode::CONFLICT);
    assert_eq!(mismatch.body["code"], "body_mismatch");

    let revoked = h
        .call(
            "POST",
            "/v1/auth/logout",
            None,
            &[(AUTHORIZATION.as_str(), user_auth.as_str())],
        )
        .await?;
    assert_eq!(revoked.status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn health_reports_build_and_request_id() -> Result<()> {
    let h = harness(Options::default())?;
    let reply = h.call("GET", "/health", None, &[]).await?;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.request_id);
    assert_eq!(reply.body["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(reply.body["database"], "memory");
    Ok(())
}
