use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::idempotency::IdempotencyLedger;
use crate::keys::TokenIssuer;
use crate::limits::{AllowList, BruteForceLimiter, TokenBucketLimiter, WindowLimiter};
use crate::password::PasswordHasher;
use crate::refresh::RefreshLedger;
use crate::revocation::RevocationStore;
use crate::users::UserStore;

const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_FAILED_LOGIN_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_ADMIN_REVOKE_TTL: Duration = Duration::from_secs(60 * 60);

/// Lifetimes and delays used by the auth handlers. The access token
/// lifetime belongs to the [`TokenIssuer`].
#[derive(Clone, Debug)]
pub struct AuthConfig {
    refresh_ttl: Duration,
    failed_login_delay: Duration,
    admin_revoke_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_ttl: DEFAULT_REFRESH_TTL,
            failed_login_delay: DEFAULT_FAILED_LOGIN_DELAY,
            admin_revoke_ttl: DEFAULT_ADMIN_REVOKE_TTL,
        }
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_failed_login_delay(mut self, delay: Duration) -> Self {
        self.failed_login_delay = delay;
        self
    }

    #[must_use]
    pub fn with_admin_revoke_ttl(mut self, ttl: Duration) -> Self {
        self.admin_revoke_ttl = ttl;
        self
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    #[must_use]
    pub fn failed_login_delay(&self) -> Duration {
        self.failed_login_delay
    }

    #[must_use]
    pub fn admin_revoke_ttl(&self) -> Duration {
        self.admin_revoke_ttl
    }
}

/// Every limiter the router applies.
pub struct Limiters {
    /// Per client address, every route.
    pub client: Arc<TokenBucketLimiter>,
    /// Per login identity.
    pub identity: Arc<TokenBucketLimiter>,
    /// Shared budget per client address on non-auth routes.
    pub global: WindowLimiter,
    /// Shared budget per client address on auth routes.
    pub auth: WindowLimiter,
    pub brute: BruteForceLimiter,
    /// Clients exempt from the shared and brute-force limiters.
    pub allow: AllowList,
    /// Peers whose forwarding headers name the real client.
    pub trusted_proxies: AllowList,
}

/// Components shared by every request.
pub struct AppState {
    pub clock: Arc<dyn Clock>,
    pub tokens: TokenIssuer,
    pub refresh: Arc<dyn RefreshLedger>,
    pub revocations: Arc<dyn RevocationStore>,
    pub idempotency: Arc<dyn IdempotencyLedger>,
    pub users: Arc<dyn UserStore>,
    pub passwords: Arc<dyn PasswordHasher>,
    pub limits: Limiters,
    pub auth: AuthConfig,
    /// Pinged by the health check when present.
    pub pool: Option<PgPool>,
}
