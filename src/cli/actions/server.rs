use crate::api::{self, sweeper::Sweeper, AppState, AuthConfig, Limiters};
use crate::cli::commands::{auth, limits};
use crate::clock::{Clock, SystemClock};
use crate::idempotency::PgIdempotencyLedger;
use crate::keys::{KeyRing, TokenIssuer};
use crate::limits::{AllowList, BruteForceLimiter, TokenBucketLimiter, WindowLimiter};
use crate::password::Argon2Hasher;
use crate::refresh::PgRefreshLedger;
use crate::revocation::SharedRevocationStore;
use crate::store::{FastStore, PgFastStore};
use crate::users::PgUserStore;
use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub db_timeout: Duration,
    pub idempotency_retention: Duration,
    pub sweep_interval: Duration,
    pub auth: auth::Options,
    pub limits: limits::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the key ring is invalid, the database is unreachable,
/// or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let keys = KeyRing::parse(
        args.auth.keys.expose_secret(),
        args.auth.current_kid.as_deref(),
        args.auth.fallback_kid.as_deref(),
    )
    .context("Invalid signing key configuration")?;
    let tokens = TokenIssuer::new(
        Arc::new(keys),
        args.auth.issuer.clone(),
        args.auth.audience.clone(),
        args.auth.access_ttl,
    )
    .with_leeway(args.auth.clock_skew);

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 2))
        .acquire_timeout(args.db_timeout)
        .test_before_acquire(true)
        .connect(&args.dsn)
        .await
        .context("Failed to connect to database")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let fast: Arc<dyn FastStore> = Arc::new(PgFastStore::new(pool.clone(), args.db_timeout));
    let refresh = Arc::new(PgRefreshLedger::new(
        pool.clone(),
        clock.clone(),
        args.db_timeout,
    ));
    let idempotency = Arc::new(PgIdempotencyLedger::new(pool.clone(), args.db_timeout));

    let limits = build_limiters(&args.limits, &fast);
    let _client_sweeper = limits.client.spawn_sweeper();
    let _identity_sweeper = limits.identity.spawn_sweeper();

    let _sweeper = Sweeper {
        clock: clock.clone(),
        fast: fast.clone(),
        refresh: refresh.clone(),
        idempotency: idempotency.clone(),
        idempotency_retention: args.idempotency_retention,
    }
    .spawn(args.sweep_interval);

    let state = AppState {
        clock,
        tokens,
        refresh,
        revocations: Arc::new(SharedRevocationStore::new(fast)),
        idempotency,
        users: Arc::new(PgUserStore::new(pool.clone(), args.db_timeout)),
        passwords: Arc::new(Argon2Hasher::new()?),
        limits,
        auth: AuthConfig::new()
            .with_refresh_ttl(args.auth.refresh_ttl)
            .with_failed_login_delay(args.auth.failed_login_delay)
            .with_admin_revoke_ttl(args.auth.admin_revoke_ttl),
        pool: Some(pool),
    };

    api::serve(args.port, Arc::new(state)).await
}

fn build_limiters(options: &limits::Options, fast: &Arc<dyn FastStore>) -> Limiters {
    let window = |prefix: &str, limit: u64, window: Duration| {
        WindowLimiter::new(fast.clone(), prefix, limit, window).with_fail_mode(options.fail_mode)
    };

    Limiters {
        client: Arc::new(TokenBucketLimiter::new(
            options.rate_rps,
            options.rate_burst,
            options.idle_ttl,
        )),
        identity: Arc::new(TokenBucketLimiter::new(
            options.identity_rps,
            options.identity_burst,
            options.idle_ttl,
        )),
        global: window("rl:global", options.window_limit, options.window),
        auth: window("rl:auth", options.auth_window_limit, options.window),
        brute: BruteForceLimiter::new(window(
            "rl:brute",
            options.brute_limit,
            options.brute_window,
        )),
        allow: options.allow.clone(),
        trusted_proxies: options.trusted_proxies.clone(),
    }
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("db_timeout", format!("{}s", args.db_timeout.as_secs())),
        ("jwt_current_kid", optional(args.auth.current_kid.as_deref())),
        ("jwt_fallback_kid", optional(args.auth.fallback_kid.as_deref())),
        ("jwt_issuer", args.auth.issuer.clone()),
        ("jwt_audience", args.auth.audience.clone()),
        ("access_ttl", format!("{}s", args.auth.access_ttl.as_secs())),
        ("refresh_ttl", format!("{}s", args.auth.refresh_ttl.as_secs())),
        (
            "rate_limit",
            format!("{}/s burst {}", args.limits.rate_rps, args.limits.rate_burst),
        ),
        (
            "shared_window",
            format!(
                "{} ({} auth) per {}s",
                args.limits.window_limit,
                args.limits.auth_window_limit,
                args.limits.window.as_secs()
            ),
        ),
        (
            "brute_force",
            format!(
                "{} per {}s",
                args.limits.brute_limit,
                args.limits.brute_window.as_secs()
            ),
        ),
        ("limiter_fail_mode", format!("{:?}", args.limits.fail_mode)),
        ("allow_list", configured(&args.limits.allow)),
        ("trusted_proxies", configured(&args.limits.trusted_proxies)),
    ];
    log_entries("Startup configuration", &entries);
}

fn configured(list: &AllowList) -> String {
    if list.is_empty() {
        "none".to_string()
    } else {
        "set".to_string()
    }
}

fn optional(value: Option<&str>) -> String {
    value.unwrap_or("n/a").to_string()
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "warden {} - {}\n\n{title}:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> String {
    hash.trim().chars().take(7).collect()
}
