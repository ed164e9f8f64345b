use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{normalize_email, Role, User, UserStore};
use crate::error::{Error, Result};
use crate::store::bounded;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct PgUserStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgUserStore {
    #[must_use]
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let query = "SELECT id, email, password_hash FROM users WHERE email = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "users"
        );
        let row = bounded(self.timeout, "user lookup", async {
            sqlx::query(query)
                .bind(normalize_email(email))
                .fetch_optional(&self.pool)
                .instrument(span)
                .await
                .context("failed to look up user")
        })
        .await
        .map_err(Error::Transient)?;

        Ok(row.map(|row| User {
            id: row.get("id"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
        }))
    }

    async fn create(&self, email: &str, password_hash: &str) -> Result<Uuid> {
        let query = "INSERT INTO users (id, email, password_hash) VALUES ($1, $2, $3)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.sql.table = "users"
        );
        let id = Uuid::now_v7();
        let inserted = tokio::time::timeout(
            self.timeout,
            sqlx::query(query)
                .bind(id)
                .bind(normalize_email(email))
                .bind(password_hash)
                .execute(&self.pool)
                .instrument(span),
        )
        .await
        .map_err(|_| Error::Transient(anyhow::anyhow!("user insert exceeded its deadline")))?;

        match inserted {
            Ok(_) => Ok(id),
            Err(err) if is_unique_violation(&err) => Err(Error::Conflict),
            Err(err) => Err(Error::Transient(
                anyhow::Error::new(err).context("failed to insert user"),
            )),
        }
    }

    async fn assign_role(&self, user_id: Uuid, role: Role) -> Result<()> {
        let query = r"
            INSERT INTO user_roles (user_id, role)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.sql.table = "user_roles"
        );
        bounded(self.timeout, "role assignment", async {
            sqlx::query(query)
                .bind(user_id)
                .bind(role.as_str())
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to assign role")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(())
    }

    async fn has_role(&self, user_id: Uuid, role: Role) -> Result<bool> {
        let query = "SELECT EXISTS (SELECT 1 FROM user_roles WHERE user_id = $1 AND role = $2)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.sql.table = "user_roles"
        );
        let row = bounded(self.timeout, "role check", async {
            sqlx::query(query)
                .bind(user_id)
                .bind(role.as_str())
                .fetch_one(&self.pool)
                .instrument(span)
                .await
                .context("failed to check role")
        })
        .await
        .map_err(Error::Transient)?;
        Ok(row.get(0))
    }
}
