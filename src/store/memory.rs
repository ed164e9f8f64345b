use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{Counter, FastStore};
use crate::clock::{self, Clock};

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Single-process [`FastStore`] for tests and one-node deployments.
pub struct MemoryFastStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryFastStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> anyhow::Result<Counter> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        entry.expires_at = clock::after(now, window);
        Ok(Counter {
            count: entry.count,
            expires_in: window,
        })
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> anyhow::Result<()> {
        let now = self.clock.now();
        let expires_at = clock::after(now, ttl);
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 1,
            expires_at,
        });
        if entry.expires_at < expires_at {
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    async fn time_to_live(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| clock::remaining(now, entry.expires_at)))
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(u64::try_from(before - entries.len()).unwrap_or(u64::MAX))
    }
}
