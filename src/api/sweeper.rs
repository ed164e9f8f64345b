//! Background cleanup of expired state.
//!
//! Runs until aborted: evicts expired fast-store keys and refresh tokens,
//! and idempotency records older than their retention window. Failures are
//! logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::idempotency::IdempotencyLedger;
use crate::refresh::RefreshLedger;
use crate::store::FastStore;

pub struct Sweeper {
    pub clock: Arc<dyn Clock>,
    pub fast: Arc<dyn FastStore>,
    pub refresh: Arc<dyn RefreshLedger>,
    pub idempotency: Arc<dyn IdempotencyLedger>,
    pub idempotency_retention: Duration,
}

impl Sweeper {
    /// One pass over every store.
    pub async fn sweep(&self) {
        match self.fast.purge_expired().await {
            Ok(purged) if purged > 0 => debug!(purged, "purged expired fast store keys"),
            Ok(_) => {}
            Err(err) => error!("Failed to purge fast store: {err:#}"),
        }
        match self.refresh.purge_expired().await {
            Ok(purged) if purged > 0 => debug!(purged, "purged expired refresh tokens"),
            Ok(_) => {}
            Err(err) => error!("Failed to purge refresh tokens: {err}"),
        }
        let retention = chrono::Duration::from_std(self.idempotency_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        match self.idempotency.purge_claimed_before(cutoff).await {
            Ok(purged) if purged > 0 => debug!(purged, "purged old idempotency records"),
            Ok(_) => {}
            Err(err) => error!("Failed to purge idempotency records: {err}"),
        }
    }

    #[must_use]
    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{self, ManualClock};
    use crate::idempotency::{Claim, IdempotencyRequest, MemoryIdempotencyLedger};
    use crate::refresh::MemoryRefreshLedger;
    use crate::store::MemoryFastStore;
    use axum::http::Method;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_drops_expired_state() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default(),
        ));
        let fast = Arc::new(MemoryFastStore::new(clock.clone()));
        let refresh = Arc::new(MemoryRefreshLedger::new(clock.clone()));
        let idempotency = Arc::new(MemoryIdempotencyLedger::new(clock.clone()));

        fast.set_with_expiry("jti:a", Duration::from_secs(10)).await?;
        let token = refresh
            .issue(Uuid::new_v4(), clock::after(clock.now(), Duration::from_secs(10)))
            .await?;
        let request =
            IdempotencyRequest::new("k".to_string(), Uuid::nil(), &Method::PUT, "/notes/1", b"x");
        idempotency.claim(&request).await?;

        let sweeper = Sweeper {
            clock: clock.clone(),
            fast: fast.clone(),
            refresh: refresh.clone(),
            idempotency: idempotency.clone(),
            idempotency_retention: Duration::from_secs(60),
        };
        clock.advance(Duration::from_secs(61));
        sweeper.sweep().await;

        assert_eq!(fast.time_to_live("jti:a").await?, None);
        assert_eq!(refresh.purge_expired().await?, 0);
        assert!(refresh
            .use_and_rotate(&token, clock.now())
            .await
            .is_err());
        assert_eq!(idempotency.claim(&request).await?, Claim::Fresh);
        Ok(())
    }
}
