use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A stored user record. Passwords are bcrypt hashes, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        email: impl Into<String>,
        password: &str,
        name: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            email: email.into(),
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
            name: name.into(),
            created_at: Utc::now(),
        })
    }

    pub fn verify_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }
}

/// User persistence abstraction; the persistence module offers a
/// database-backed implementation.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails if the email is taken.
    async fn create(&self, user: &User) -> anyhow::Result<()>;

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
}

/// In-memory store for tests and single-run deployments.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, user: &User) -> anyhow::Result<()> {
        let mut users = self.users.write();
        if users.contains_key(&user.email) {
            anyhow::bail!("user '{}' already exists", user.email);
        }
        users.insert(user.email.clone(), user.clone());
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        Ok(self.users.read().get(email).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn password_hashing_round_trips() {
        let user = User::new("ada@example.com", "s3cret!", "Ada").unwrap();
        assert_ne!(user.password_hash, "s3cret!");
        assert!(user.password_hash.starts_with("$2"));
        assert!(user.verify_password("s3cret!"));
        assert!(!user.verify_password("wrong"));
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let store = MemoryUserStore::new();
        let user = User::new("ada@example.com", "pw", "Ada").unwrap();
        store.create(&user).await.unwrap();
        assert!(store.create(&user).await.is_err());

        let found = store.find_by_email("ada@example.com").await.unwrap();
        assert_eq!(found.unwrap().name, "Ada");
    }
}
