//! chatkey-crypto: key primitives for per-chat message encryption.
//!
//! AES-256-GCM message cipher, X25519 key wrapping, Ed25519 record
//! signatures, sealed user identities, and client key stores backed by
//! memory, a process session, or encrypted SQLite (SQLCipher).

pub mod cipher;
pub mod error;
pub mod identity;
pub mod key;
pub mod keystore;
pub mod master_key;
pub mod signature;
pub mod storage;
pub mod wrap;
