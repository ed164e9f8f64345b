use crate::users::{normalize_email, PgUserStore, Role, UserStore};
use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub struct Args {
    pub dsn: String,
    pub db_timeout: Duration,
    pub email: String,
}

/// Grant the admin role to an already registered user.
/// # Errors
/// Returns an error if the database is unreachable or no user has the email.
pub async fn execute(args: Args) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(args.db_timeout)
        .connect(&args.dsn)
        .await
        .context("Failed to connect to database")?;
    let users = PgUserStore::new(pool, args.db_timeout);

    let user_id = grant_admin(&users, &args.email).await?;
    println!("{user_id} is now an admin");
    Ok(())
}

/// Look the user up by email and assign [`Role::Admin`]. Granting twice is
/// harmless.
///
/// # Errors
/// Returns an error if no user has the email or the store fails.
pub async fn grant_admin(users: &dyn UserStore, email: &str) -> Result<Uuid> {
    let email = normalize_email(email);
    let user = users
        .find_by_email(&email)
        .await?
        .ok_or_else(|| anyhow!("no user registered with email '{email}'"))?;
    users.assign_role(user.id, Role::Admin).await?;
    info!(user_id = %user.id, "admin role granted");
    Ok(user.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::MemoryUserStore;

    #[tokio::test]
    async fn grants_admin_to_registered_user() -> Result<()> {
        let users = MemoryUserStore::new();
        let id = users.create("ops@example.com", "hash").await?;
        assert!(!users.has_role(id, Role::Admin).await?);

        assert_eq!(grant_admin(&users, " Ops@Example.com ").await?, id);
        assert!(users.has_role(id, Role::Admin).await?);
        assert_eq!(grant_admin(&users, "ops@example.com").await?, id);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_email_is_an_error() {
        let users = MemoryUserStore::new();
        let result = grant_admin(&users, "nobody@example.com").await;
        assert!(result.is_err());
    }
}
