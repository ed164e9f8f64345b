//! `fast_kv` table as the shared fast store.
//!
//! The table is `UNLOGGED`: contents may vanish on crash recovery, which
//! loses rate-limit counters and revocations that would expire on their own
//! anyway. Expiry uses the database clock so every instance agrees on it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{info_span, Instrument};

use super::{bounded, Counter, FastStore};

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Clone, Debug)]
pub struct PgFastStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgFastStore {
    #[must_use]
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl FastStore for PgFastStore {
    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<Counter> {
        let query = r"
            INSERT INTO fast_kv (key, counter, expires_at)
            VALUES ($1, 1, now() + $2::bigint * interval '1 millisecond')
            ON CONFLICT (key) DO UPDATE SET
                counter = CASE
                    WHEN fast_kv.expires_at <= now() THEN 1
                    ELSE fast_kv.counter + 1
                END,
                expires_at = EXCLUDED.expires_at
            RETURNING counter
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.sql.table = "fast_kv"
        );
        let row = bounded(self.timeout, "fast_kv increment", async {
            sqlx::query(query)
                .bind(key)
                .bind(millis(window))
                .fetch_one(&self.pool)
                .instrument(span)
                .await
                .context("failed to increment fast_kv counter")
        })
        .await?;

        let count: i64 = row.get("counter");
        Ok(Counter {
            count: u64::try_from(count).unwrap_or(0),
            expires_in: window,
        })
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let query = r"
            INSERT INTO fast_kv (key, counter, expires_at)
            VALUES ($1, 1, now() + $2::bigint * interval '1 millisecond')
            ON CONFLICT (key) DO UPDATE SET
                expires_at = GREATEST(fast_kv.expires_at, EXCLUDED.expires_at)
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPSERT",
            db.sql.table = "fast_kv"
        );
        bounded(self.timeout, "fast_kv set", async {
            sqlx::query(query)
                .bind(key)
                .bind(millis(ttl))
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to set fast_kv key")
        })
        .await?;
        Ok(())
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        let query = r"
            SELECT (EXTRACT(EPOCH FROM (expires_at - now())) * 1000)::bigint AS ttl_ms
            FROM fast_kv
            WHERE key = $1 AND expires_at > now()
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "fast_kv"
        );
        let row = bounded(self.timeout, "fast_kv ttl", async {
            sqlx::query(query)
                .bind(key)
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .context("failed to read fast_kv ttl")
        })
        .await?;

        Ok(row.map(|row| {
            let ttl_ms: i64 = row.get("ttl_ms");
            Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0))
        }))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM fast_kv WHERE expires_at <= now()";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.sql.table = "fast_kv"
        );
        let result = bounded(self.timeout, "fast_kv purge", async {
            sqlx::query(query)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to purge fast_kv")
        })
        .await?;
        Ok(result.rows_affected())
    }
}
