//! Remote cache storage stub.

use super::{KeyValStorage, StorageError};
use crate::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Placeholder for a remote key/value backend.
///
/// Carries the endpoint configuration but reports
/// [`StorageError::Unavailable`] for every operation until a real client is
/// wired in. Because the response builder tolerates storage failures, a
/// composition configured with this storage still completes; it just never
/// reuses static nodes across requests.
#[derive(Debug, Clone)]
pub struct RemoteKeyValStorage {
    endpoint: String,
}

impl RemoteKeyValStorage {
    /// Create a remote storage stub pointing at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl KeyValStorage for RemoteKeyValStorage {
    fn get<'a>(
        &'a self,
        _ctx: &'a CancellationToken,
        _key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        Box::pin(async move {
            Err(StorageError::Unavailable(format!(
                "remote backend at {} is not implemented",
                self.endpoint
            )))
        })
    }

    fn set<'a>(
        &'a self,
        _ctx: &'a CancellationToken,
        _key: &'a str,
        _value: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            Err(StorageError::Unavailable(format!(
                "remote backend at {} is not implemented",
                self.endpoint
            )))
        })
    }
}
