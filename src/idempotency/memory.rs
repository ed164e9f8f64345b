use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{Claim, IdempotencyLedger, IdempotencyRequest, StoredResponse};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Record {
    method: String,
    path: String,
    body_hash: Vec<u8>,
    claimed_at: DateTime<Utc>,
    response: Option<StoredResponse>,
}

pub struct MemoryIdempotencyLedger {
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<(String, Uuid), Record>>,
}

impl MemoryIdempotencyLedger {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIdempotencyLedger {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryIdempotencyLedger {
    async fn claim(&self, request: &IdempotencyRequest) -> Result<Claim> {
        let mut records = self.records.lock().await;
        let slot = (request.key.clone(), request.subject);
        let Some(existing) = records.get(&slot) else {
            records.insert(
                slot,
                Record {
                    method: request.method.clone(),
                    path: request.path.clone(),
                    body_hash: request.body_hash.clone(),
                    claimed_at: self.clock.now(),
                    response: None,
                },
            );
            return Ok(Claim::Fresh);
        };

        if existing.body_hash != request.body_hash {
            debug!(
                key = %request.key,
                first_method = %existing.method,
                first_path = %existing.path,
                "idempotency key reused with a different body"
            );
            return Err(Error::BodyMismatch);
        }
        existing
            .response
            .clone()
            .map(Claim::Replay)
            .ok_or(Error::InProgress)
    }

    async fn complete(&self, key: &str, subject: Uuid, response: &StoredResponse) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&(key.to_string(), subject)) {
            if record.response.is_none() {
                record.response = Some(response.clone());
            }
        }
        Ok(())
    }

    async fn release(&self, key: &str, subject: Uuid) -> Result<()> {
        let mut records = self.records.lock().await;
        let slot = (key.to_string(), subject);
        if records
            .get(&slot)
            .is_some_and(|record| record.response.is_none())
        {
            records.remove(&slot);
        }
        Ok(())
    }

    async fn purge_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.claimed_at >= cutoff);
        Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
    }
}
