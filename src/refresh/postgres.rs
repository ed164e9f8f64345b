//! Postgres refresh ledger.
//!
//! `use_and_rotate` holds a `FOR UPDATE` lock on the presented token's row
//! from the read until commit, so concurrent callers with the same token
//! serialize and only the first one finds it unused.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use super::{hash_token, new_token, RefreshLedger, Rotation};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::bounded;

pub struct PgRefreshLedger {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl PgRefreshLedger {
    #[must_use]
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            pool,
            clock,
            timeout,
        }
    }
}

#[async_trait]
impl RefreshLedger for PgRefreshLedger {
    async fn issue(&self, subject: Uuid, expires_at: DateTime<Utc>) -> Result<String> {
        let token = new_token()?;
        let query =
            "INSERT INTO refresh_tokens (token_hash, user_id, expires_at) VALUES ($1, $2, $3)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.sql.table = "refresh_tokens"
        );
        bounded(self.timeout, "refresh token issue", async {
            sqlx::query(query)
                .bind(hash_token(&token))
                .bind(subject)
                .bind(expires_at)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to insert refresh token")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(token)
    }

    async fn use_and_rotate(&self, token: &str, new_expires_at: DateTime<Utc>) -> Result<Rotation> {
        let now = self.clock.now();
        let hash = hash_token(token);
        let next = new_token()?;

        let outcome = bounded(self.timeout, "refresh token rotation", async {
            let mut tx = self
                .pool
                .begin()
                .await
                .context("failed to begin refresh rotation")?;

            let query = r"
                SELECT user_id, used_at
                FROM refresh_tokens
                WHERE token_hash = $1 AND expires_at > $2
                FOR UPDATE
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "SELECT",
                db.sql.table = "refresh_tokens"
            );
            let row = sqlx::query(query)
                .bind(&hash)
                .bind(now)
                .fetch_optional(&mut *tx)
                .instrument(span)
                .await
                .context("failed to lock refresh token")?;

            let Some(row) = row else {
                return Ok(None);
            };
            let subject: Uuid = row.get("user_id");
            let used_at: Option<DateTime<Utc>> = row.get("used_at");

            if used_at.is_some() {
                let query = "DELETE FROM refresh_tokens WHERE user_id = $1 AND used_at IS NULL";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "DELETE",
                    db.sql.table = "refresh_tokens"
                );
                sqlx::query(query)
                    .bind(subject)
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .context("failed to revoke refresh token family")?;
                tx.commit()
                    .await
                    .context("failed to commit refresh token revocation")?;
                return Ok(Some(Rotation::Reused { subject }));
            }

            let query = "UPDATE refresh_tokens SET used_at = $2 WHERE token_hash = $1";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.sql.table = "refresh_tokens"
            );
            sqlx::query(query)
                .bind(&hash)
                .bind(now)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to mark refresh token used")?;

            let query =
                "INSERT INTO refresh_tokens (token_hash, user_id, expires_at) VALUES ($1, $2, $3)";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.sql.table = "refresh_tokens"
            );
            sqlx::query(query)
                .bind(hash_token(&next))
                .bind(subject)
                .bind(new_expires_at)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to insert rotated refresh token")?;

            tx.commit()
                .await
                .context("failed to commit refresh rotation")?;
            Ok(Some(Rotation::Rotated {
                subject,
                token: next.clone(),
            }))
        })
        .await
        .map_err(Error::Transient)?;

        match outcome {
            Some(Rotation::Reused { subject }) => {
                warn!(
                    security_event = "refresh_token_reuse",
                    subject = %subject,
                    "refresh token presented twice; live sessions revoked"
                );
                Ok(Rotation::Reused { subject })
            }
            Some(rotated) => Ok(rotated),
            None => Err(Error::Unauthorized),
        }
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        let query = "DELETE FROM refresh_tokens WHERE token_hash = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.sql.table = "refresh_tokens"
        );
        bounded(self.timeout, "refresh token revoke", async {
            sqlx::query(query)
                .bind(hash_token(token))
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to revoke refresh token")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let query = "DELETE FROM refresh_tokens WHERE expires_at <= $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.sql.table = "refresh_tokens"
        );
        let result = bounded(self.timeout, "refresh token purge", async {
            sqlx::query(query)
                .bind(now)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to purge refresh tokens")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(result.rows_affected())
    }
}
