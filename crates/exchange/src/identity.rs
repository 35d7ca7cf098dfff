//! Identity provisioning. Argon2id sealing and keypair generation run on
//! blocking workers so async callers are never stalled.

use chatkey_crypto::identity::{generate_identity, PublicIdentity, SealedPrivateKey, UserIdentity};
use chatkey_shared::ids::UserId;
use zeroize::Zeroizing;

use crate::directory::Directory;
use crate::error::ExchangeError;

/// Generate a sealed identity for `user_id` and publish its public half.
pub async fn provision_identity(
    user_id: UserId,
    secret: Zeroizing<Vec<u8>>,
    directory: &dyn Directory,
) -> Result<UserIdentity, ExchangeError> {
    let identity =
        tokio::task::spawn_blocking(move || generate_identity(user_id, &secret)).await??;
    directory
        .publish_public_key(user_id, identity.public_key.clone())
        .await?;
    tracing::info!(user_id = %user_id, "identity provisioned");
    Ok(identity)
}

/// Reopen a persisted identity with the user secret.
pub async fn unlock_identity(
    user_id: UserId,
    public_key: PublicIdentity,
    sealed: SealedPrivateKey,
    secret: Zeroizing<Vec<u8>>,
) -> Result<UserIdentity, ExchangeError> {
    let identity = tokio::task::spawn_blocking(move || {
        UserIdentity::unlock(user_id, public_key, sealed, &secret)
    })
    .await??;
    Ok(identity)
}
