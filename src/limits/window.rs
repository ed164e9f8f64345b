use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use super::Decision;
use crate::store::FastStore;

/// What to do when the shared store cannot be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailMode {
    Open,
    /// Reject. Favors brute-force protection over availability.
    #[default]
    Closed,
}

/// Fixed-budget counter per key in the shared fast store. Every hit
/// increments the counter and pushes its expiry back to `window`.
pub struct WindowLimiter {
    store: Arc<dyn FastStore>,
    prefix: String,
    limit: u64,
    window: Duration,
    fail_mode: FailMode,
}

impl WindowLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn FastStore>, prefix: &str, limit: u64, window: Duration) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            limit,
            window,
            fail_mode: FailMode::default(),
        }
    }

    #[must_use]
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn check(&self, key: &str) -> Decision {
        let key = format!("{}:{key}", self.prefix);
        match self.store.incr_with_expiry(&key, self.window).await {
            Ok(counter) if counter.count > self.limit => Decision::Limited {
                retry_after: counter.expires_in.min(self.window),
            },
            Ok(counter) => Decision::Allowed {
                remaining: self.limit - counter.count,
            },
            Err(err) => {
                error!(
                    limiter = %self.prefix,
                    fail_mode = ?self.fail_mode,
                    "rate limit store unavailable: {err:#}"
                );
                match self.fail_mode {
                    FailMode::Open => Decision::Allowed { remaining: 0 },
                    FailMode::Closed => Decision::Limited {
                        retry_after: self.window,
                    },
                }
            }
        }
    }
}
