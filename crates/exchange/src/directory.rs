//! Public key directory collaborator.

use async_trait::async_trait;
use chatkey_crypto::identity::PublicIdentity;
use chatkey_shared::ids::UserId;
use dashmap::DashMap;

use crate::error::ExchangeError;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_public_key(&self, user: UserId) -> Result<PublicIdentity, ExchangeError>;

    async fn publish_public_key(
        &self,
        user: UserId,
        public_key: PublicIdentity,
    ) -> Result<(), ExchangeError>;
}

/// Process-local directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    keys: DashMap<UserId, PublicIdentity>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get_public_key(&self, user: UserId) -> Result<PublicIdentity, ExchangeError> {
        self.keys
            .get(&user)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ExchangeError::Directory(format!("no public key for user {user}")))
    }

    async fn publish_public_key(
        &self,
        user: UserId,
        public_key: PublicIdentity,
    ) -> Result<(), ExchangeError> {
        self.keys.insert(user, public_key);
        tracing::debug!(user_id = %user, "published public key");
        Ok(())
    }
}
