//! Pluggable key/value persistence for static node snapshots.
//!
//! The response builder only ever round-trips opaque byte blobs keyed by
//! string, so the storage seam stays deliberately small. Implementations may
//! be local or remote; the builder treats every storage failure as
//! "proceed without cached state".

mod memory;
mod remote;

pub use memory::InMemKeyValStorage;
pub use remote::RemoteKeyValStorage;

use crate::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or is not configured.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    /// I/O failure while talking to the backend.
    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte blob persistence keyed by string.
///
/// A missing key is `Ok(None)`, never an error. Callers that need to
/// distinguish "no prior state" from "backend down" match on the `Result`
/// first and the `Option` second.
pub trait KeyValStorage: Send + Sync {
    /// Fetch the blob stored under `key`, if any.
    fn get<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>>;

    /// Store `value` under `key`, replacing any previous blob.
    fn set<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        key: &'a str,
        value: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), StorageError>>;
}

/// Trait object [`KeyValStorage`].
pub type DynKeyValStorage = std::sync::Arc<dyn KeyValStorage>;

/// Storage that never stores anything.
///
/// Every read misses and every write is accepted and discarded. Useful for
/// compositions that have no static nodes, and for tests that must prove a
/// code path never touches persistence.
#[derive(Debug, Clone, Default)]
pub struct NopKeyValStorage;

impl NopKeyValStorage {
    /// Create a new no-op storage.
    pub fn new() -> Self {
        Self
    }
}

impl KeyValStorage for NopKeyValStorage {
    fn get<'a>(
        &'a self,
        _ctx: &'a CancellationToken,
        _key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        Box::pin(async { Ok(None) })
    }

    fn set<'a>(
        &'a self,
        _ctx: &'a CancellationToken,
        _key: &'a str,
        _value: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nop_storage_always_misses() {
        let storage = NopKeyValStorage::new();
        let ctx = CancellationToken::new();

        let got = storage.get(&ctx, "anything").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_nop_storage_set_discards() {
        let storage = NopKeyValStorage::new();
        let ctx = CancellationToken::new();

        storage.set(&ctx, "key", vec![1, 2, 3]).await.unwrap();
        assert_eq!(storage.get(&ctx, "key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nop_storage_as_trait_object() {
        let storage: DynKeyValStorage = std::sync::Arc::new(NopKeyValStorage::new());
        let ctx = CancellationToken::new();

        assert!(storage.set(&ctx, "key", vec![1]).await.is_ok());
        assert_eq!(storage.get(&ctx, "key").await.unwrap(), None);
    }

    #[test]
    fn test_storage_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NopKeyValStorage>();
    }
}
