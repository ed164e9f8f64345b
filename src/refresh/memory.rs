use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::{hash_token, new_token, RefreshLedger, Rotation};
use crate::clock::Clock;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Row {
    subject: Uuid,
    expires_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
}

/// In-process ledger. The mutex spans each whole operation, which gives the
/// same per-token linearizability as the row lock in Postgres.
pub struct MemoryRefreshLedger {
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<Vec<u8>, Row>>,
}

impl MemoryRefreshLedger {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rows: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RefreshLedger for MemoryRefreshLedger {
    async fn issue(&self, subject: Uuid, expires_at: DateTime<Utc>) -> Result<String> {
        let token = new_token()?;
        self.rows.lock().await.insert(
            hash_token(&token),
            Row {
                subject,
                expires_at,
                used_at: None,
            },
        );
        Ok(token)
    }

    async fn use_and_rotate(&self, token: &str, new_expires_at: DateTime<Utc>) -> Result<Rotation> {
        let now = self.clock.now();
        let hash = hash_token(token);
        let mut rows = self.rows.lock().await;

        let row = rows
            .get(&hash)
            .filter(|row| row.expires_at > now)
            .cloned()
            .ok_or(Error::Unauthorized)?;

        if row.used_at.is_some() {
            let subject = row.subject;
            rows.retain(|_, other| other.subject != subject || other.used_at.is_some());
            warn!(
                security_event = "refresh_token_reuse",
                subject = %subject,
                "refresh token presented twice; live sessions revoked"
            );
            return Ok(Rotation::Reused { subject });
        }

        let next = new_token()?;
        if let Some(current) = rows.get_mut(&hash) {
            current.used_at = Some(now);
        }
        rows.insert(
            hash_token(&next),
            Row {
                subject: row.subject,
                expires_at: new_expires_at,
                used_at: None,
            },
        );
        Ok(Rotation::Rotated {
            subject: row.subject,
            token: next,
        })
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        self.rows.lock().await.remove(&hash_token(token));
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| row.expires_at > now);
        Ok(u64::try_from(before - rows.len()).unwrap_or(u64::MAX))
    }
}
