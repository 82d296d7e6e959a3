//! In-memory key/value storage.

use super::{KeyValStorage, StorageError};
use crate::BoxFuture;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Concurrent in-memory storage.
///
/// Blobs live in a [`DashMap`], so reads and writes from parallel
/// compositions never contend on a single lock. Intended for tests and for
/// single-process deployments where snapshots do not need to survive a
/// restart.
#[derive(Debug, Default)]
pub struct InMemKeyValStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemKeyValStorage {
    /// Create an empty in-memory storage.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValStorage for InMemKeyValStorage {
    fn get<'a>(
        &'a self,
        _ctx: &'a CancellationToken,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        let found = self.entries.get(key).map(|entry| entry.value().clone());
        Box::pin(async move { Ok(found) })
    }

    fn set<'a>(
        &'a self,
        _ctx: &'a CancellationToken,
        key: &'a str,
        value: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        self.entries.insert(key.to_string(), value);
        Box::pin(async { Ok(()) })
    }
}
