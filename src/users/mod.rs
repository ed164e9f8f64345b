//! User directory: identities, password hashes and role membership.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

pub use memory::MemoryUserStore;
pub use postgres::PgUserStore;

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// # Errors
    /// Returns [`Error::Conflict`] if the email is already registered.
    async fn create(&self, email: &str, password_hash: &str) -> Result<Uuid>;

    async fn assign_role(&self, user_id: Uuid, role: Role) -> Result<()>;

    async fn has_role(&self, user_id: Uuid, role: Role) -> Result<bool>;
}

#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// # Errors
/// Returns [`Error::BadRequest`] describing the first problem found.
pub fn validate_credentials(email: &str, password: &str) -> Result<()> {
    if !Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email)) {
        return Err(Error::BadRequest("invalid email".to_string()));
    }
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(Error::BadRequest(format!(
            "password must be {MIN_PASSWORD_LEN} to {MAX_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}
