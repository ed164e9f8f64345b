//! Request rate limiting.
//!
//! Three independent strategies applied in order:
//! 1) [`TokenBucketLimiter`]: in-process bucket per client address (and per
//!    login identity), refill `rate`/s up to `burst`.
//! 2) [`WindowLimiter`]: counter in the shared fast store, consistent across
//!    instances.
//! 3) [`BruteForceLimiter`]: a window limiter keyed by client IP plus claimed
//!    identity, only on login.
//!
//! Addresses in the [`AllowList`] skip the shared limiters entirely.

pub mod allow;
pub mod brute;
pub mod bucket;
pub mod window;

use std::time::Duration;

use crate::error::{Error, Result};

pub use allow::AllowList;
pub use brute::BruteForceLimiter;
pub use bucket::TokenBucketLimiter;
pub use window::{FailMode, WindowLimiter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u64 },
    Limited { retry_after: Duration },
}

impl Decision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// # Errors
    /// Returns [`Error::RateLimited`] for [`Decision::Limited`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Allowed { .. } => Ok(()),
            Self::Limited { retry_after } => Err(Error::RateLimited { retry_after }),
        }
    }
}
