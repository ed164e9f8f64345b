use tracing::warn;

use super::{Decision, WindowLimiter};

/// Login attempt budget per (client IP, claimed identity).
///
/// Separate from general throttling so that hammering one account from one
/// address locks that pair out without affecting anyone else.
pub struct BruteForceLimiter {
    window: WindowLimiter,
}

impl BruteForceLimiter {
    #[must_use]
    pub fn new(window: WindowLimiter) -> Self {
        Self { window }
    }

    pub async fn check(&self, ip: &str, identity: &str) -> Decision {
        let decision = self.window.check(&key(ip, identity)).await;
        if let Decision::Limited { retry_after } = decision {
            warn!(
                security_event = "login_throttled",
                client_ip = %ip,
                retry_after_secs = retry_after.as_secs(),
                "too many login attempts"
            );
        }
        decision
    }
}

fn key(ip: &str, identity: &str) -> String {
    format!("{ip}:{}", identity.trim().to_lowercase())
}
