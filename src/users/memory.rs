use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{normalize_email, Role, User, UserStore};
use crate::error::{Error, Result};

#[derive(Default)]
struct Directory {
    by_email: HashMap<String, User>,
    roles: HashSet<(Uuid, Role)>,
}

#[derive(Default)]
pub struct MemoryUserStore {
    directory: RwLock<Directory>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let directory = self.directory.read().await;
        Ok(directory.by_email.get(&normalize_email(email)).cloned())
    }

    async fn create(&self, email: &str, password_hash: &str) -> Result<Uuid> {
        let email = normalize_email(email);
        let mut directory = self.directory.write().await;
        if directory.by_email.contains_key(&email) {
            return Err(Error::Conflict);
        }
        let id = Uuid::now_v7();
        directory.by_email.insert(
            email.clone(),
            User {
                id,
                email,
                password_hash: password_hash.to_string(),
            },
        );
        Ok(id)
    }

    async fn assign_role(&self, user_id: Uuid, role: Role) -> Result<()> {
        self.directory.write().await.roles.insert((user_id, role));
        Ok(())
    }

    async fn has_role(&self, user_id: Uuid, role: Role) -> Result<bool> {
        Ok(self.directory.read().await.roles.contains(&(user_id, role)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_email_conflicts() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        store.create("A@b.c", "hash").await?;
        assert!(matches!(
            store.create("a@B.c ", "hash").await,
            Err(Error::Conflict)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn roles_are_per_user() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let id = store.create("a@b.c", "hash").await?;
        store.assign_role(id, Role::User).await?;
        assert!(store.has_role(id, Role::User).await?);
        assert!(!store.has_role(id, Role::Admin).await?);
        assert!(!store.has_role(Uuid::new_v4(), Role::User).await?);
        Ok(())
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() -> anyhow::Result<()> {
        let store = MemoryUserStore::new();
        let id = store.create("a@b.c", "hash").await?;
        let found = store.find_by_email(" A@B.C").await?;
        assert_eq!(found.map(|user| user.id), Some(id));
        Ok(())
    }
}
