//! Interaction storage: registration, per-client encrypted ringbuffers and
//! the unencrypted literal-key channels (root-TLD and auth token).

mod crypto;
mod disk;
mod memory;

use std::sync::Arc;

use crate::correlation::LiveIdView;
use crate::error::StorageError;
use crate::metrics::CacheStats;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

#[cfg(test)]
pub(crate) mod testutil {
    pub(crate) use super::crypto::open_blob;
    pub(crate) use super::memory::tests::{test_keypair, unwrap_session_key};
}

/// Result of draining a client's ringbuffer.
#[derive(Debug)]
pub struct Drained {
    /// Sealed blobs in append order: base64(nonce || ciphertext).
    pub data: Vec<String>,
    /// base64 of the RSA-wrapped AES session key.
    pub aes_key: String,
}

/// The storage contract the server core is written against.
///
/// Implementations guarantee:
/// - a correlation id is unique while its entry lives; re-registration fails
/// - drain requires the matching secret and resets the buffer atomically
/// - an appended blob is visible to at most one successful drain
pub trait InteractionStorage: Send + Sync {
    /// Create an entry: generate a session key, wrap it under
    /// `public_key_pem` and remember `(secret, wrapped_key)`.
    fn register(
        &self,
        correlation_id: &str,
        secret: &str,
        public_key_pem: &str,
    ) -> Result<(), StorageError>;

    /// Append a sealed blob under a registered id. Unknown ids are dropped
    /// silently so registration state cannot be probed from outside.
    fn add_interaction(&self, correlation_id: &str, blob: &[u8]) -> Result<(), StorageError>;

    /// Append under an arbitrary literal key without encryption (root-TLD
    /// and auth-token channels). The channel is created on first use.
    fn add_interaction_with_id(&self, id: &str, blob: &[u8]) -> Result<(), StorageError>;

    /// Authenticate with `secret`, drain the ringbuffer and reset it.
    fn get_interactions(&self, correlation_id: &str, secret: &str)
        -> Result<Drained, StorageError>;

    /// Drain an unencrypted literal-key channel. A key nobody has written to
    /// drains empty.
    fn get_interactions_with_id(&self, id: &str) -> Result<Vec<String>, StorageError>;

    /// Authenticated removal of an entry.
    fn remove_id(&self, correlation_id: &str, secret: &str) -> Result<(), StorageError>;

    /// Drop entries and channels whose TTL deadline passed. Returns how many
    /// were evicted.
    fn evict_expired(&self) -> usize;

    /// Persist outstanding state where the backend has any.
    fn flush(&self) -> Result<(), StorageError>;

    /// Read view over live correlation ids, consumed by the token matcher.
    fn live_ids(&self) -> Arc<dyn LiveIdView>;

    fn stats(&self) -> CacheStats;
}
