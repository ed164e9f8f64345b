//! Fast shared key-value store.
//!
//! Backs the revocation denylist and the distributed limiters. It only needs
//! atomic increment-with-expiry and set/get with expiry; nothing here is
//! transactional.

pub mod memory;
pub mod postgres;

use anyhow::anyhow;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

pub use memory::MemoryFastStore;
pub use postgres::PgFastStore;

/// Result of an increment: the new count and the time left on the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub count: u64,
    pub expires_in: Duration,
}

#[async_trait]
pub trait FastStore: Send + Sync {
    /// Increment `key` and refresh its expiry to `window` in one step. A key
    /// whose expiry has passed starts again at 1.
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> anyhow::Result<Counter>;

    /// Mark `key` present for `ttl`. An existing later expiry is kept.
    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Remaining lifetime of `key`, `None` when absent or expired.
    async fn time_to_live(&self, key: &str) -> anyhow::Result<Option<Duration>>;

    /// Drop expired keys, returning how many were removed.
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

/// Bound a store operation by `deadline`.
///
/// Dropping the future on timeout drops any open transaction with it, which
/// rolls it back.
///
/// # Errors
/// Returns the operation's own error, or an error once the deadline elapses.
pub async fn bounded<T, F>(deadline: Duration, operation: &'static str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| anyhow!("{operation} exceeded its {deadline:?} deadline"))?
}
