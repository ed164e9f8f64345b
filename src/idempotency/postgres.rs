//! Postgres idempotency ledger.
//!
//! Claiming is two steps in one transaction: try a plain insert, and on
//! conflict read the existing row under `FOR UPDATE` before deciding. The
//! transaction ends before the caller's mutation starts.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{Claim, IdempotencyLedger, IdempotencyRequest, StoredResponse};
use crate::error::{Error, Result};
use crate::store::bounded;

/// What the locked row said about an earlier attempt.
enum Existing {
    Inserted,
    Mismatch,
    Pending,
    Done(StoredResponse),
}

#[derive(Clone, Debug)]
pub struct PgIdempotencyLedger {
    pool: PgPool,
    timeout: Duration,
}

impl PgIdempotencyLedger {
    #[must_use]
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl IdempotencyLedger for PgIdempotencyLedger {
    async fn claim(&self, request: &IdempotencyRequest) -> Result<Claim> {
        let existing = bounded(self.timeout, "idempotency claim", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .context("failed to begin idempotency claim")?;

            let query = r"
                INSERT INTO idempotency_keys (key, user_id, method, path, body_sha256)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (key, user_id) DO NOTHING
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.sql.table = "idempotency_keys"
            );
            let inserted = sqlx::query(query)
                .bind(&request.key)
                .bind(request.subject)
                .bind(&request.method)
                .bind(&request.path)
                .bind(&request.body_hash)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to insert idempotency claim")?
                .rows_affected();

            if inserted == 1 {
                tx.commit()
                    .await
                    .context("failed to commit idempotency claim")?;
                return Ok(Existing::Inserted);
            }

            let query = r"
                SELECT body_sha256, completed_at, status_code, result_text
                FROM idempotency_keys
                WHERE key = $1 AND user_id = $2
                FOR UPDATE
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.sql.table = "idempotency_keys"
            );
            let row = sqlx::query(query)
                .bind(&request.key)
                .bind(request.subject)
                .fetch_optional(&mut *tx)
                .instrument(span)
                .await
                .context("failed to lock idempotency claim")?;
            tx.commit()
                .await
                .context("failed to commit idempotency lookup")?;

            // Released between our insert and select; the caller retries.
            let Some(row) = row else {
                return Ok(Existing::Pending);
            };

            let body_hash: Vec<u8> = row.get("body_sha256");
            if body_hash != request.body_hash {
                return Ok(Existing::Mismatch);
            }
            let completed_at: Option<DateTime<Utc>> = row.get("completed_at");
            let status: Option<i32> = row.get("status_code");
            let body: Option<String> = row.get("result_text");
            match (completed_at, status, body) {
                (Some(_), Some(status), Some(body)) => Ok(Existing::Done(StoredResponse {
                    status: u16::try_from(status).unwrap_or(200),
                    body,
                })),
                _ => Ok(Existing::Pending),
            }
        })
        .await
        .map_err(Error::Transient)?;

        match existing {
            Existing::Inserted => Ok(Claim::Fresh),
            Existing::Done(response) => Ok(Claim::Replay(response)),
            Existing::Mismatch => Err(Error::BodyMismatch),
            Existing::Pending => Err(Error::InProgress),
        }
    }

    async fn complete(&self, key: &str, subject: Uuid, response: &StoredResponse) -> Result<()> {
        let query = r"
            UPDATE idempotency_keys
            SET status_code = $3, result_text = $4, completed_at = now()
            WHERE key = $1 AND user_id = $2 AND completed_at IS NULL
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.sql.table = "idempotency_keys"
        );
        bounded(self.timeout, "idempotency complete", async {
            sqlx::query(query)
                .bind(key)
                .bind(subject)
                .bind(i32::from(response.status))
                .bind(&response.body)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to complete idempotency claim")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(())
    }

    async fn release(&self, key: &str, subject: Uuid) -> Result<()> {
        let query = r"
            DELETE FROM idempotency_keys
            WHERE key = $1 AND user_id = $2 AND completed_at IS NULL
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.sql.table = "idempotency_keys"
        );
        bounded(self.timeout, "idempotency release", async {
            sqlx::query(query)
                .bind(key)
                .bind(subject)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to release idempotency claim")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(())
    }

    async fn purge_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM idempotency_keys WHERE claimed_at < $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.sql.table = "idempotency_keys"
        );
        let result = bounded(self.timeout, "idempotency purge", async {
            sqlx::query(query)
                .bind(cutoff)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to purge idempotency keys")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(result.rows_affected())
    }
}
