//! Fetch request and result types.

use crate::{BoxError, BoxFuture};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Closure that retrieves one piece of data.
///
/// Receives the cancellation token captured at fetch time and must honour
/// it; a cancellation error it returns propagates like any other failure.
pub type FetchFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// A fetch request: a closure to run plus a fingerprint identifying what it
/// retrieves.
///
/// Requests with equal fingerprints are considered interchangeable by the
/// fetcher and execute at most once per fetcher instance. An empty
/// fingerprint opts out of coalescing; the fetcher synthesizes a unique one.
#[derive(Clone)]
pub struct AsyncFetchReq {
    /// Fingerprint identifying the request for coalescing.
    pub hash: String,
    /// The closure that retrieves the data.
    pub fetch: FetchFn,
}

impl AsyncFetchReq {
    /// Create a fetch request from an async closure.
    pub fn new<F, Fut>(hash: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            hash: hash.into(),
            fetch: Arc::new(move |ctx| Box::pin(fetch(ctx))),
        }
    }
}

impl std::fmt::Debug for AsyncFetchReq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFetchReq")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// The settled outcome of one fetch.
///
/// `result` may legitimately be [`Value::Null`] when the fetch intentionally
/// produced no data; `err` distinguishes that from a failure. The payload is
/// `Arc`-shared so multicasting to many subscribers never copies it.
#[derive(Clone, Debug)]
pub struct AsyncFetchData {
    /// Fingerprint this result settles.
    pub hash: String,
    /// The fetched value; [`Value::Null`] when the fetch produced nothing.
    pub result: Arc<Value>,
    /// The closure's failure, if any.
    pub err: Option<Arc<BoxError>>,
}

impl AsyncFetchData {
    pub(crate) fn from_outcome(hash: String, outcome: Result<Value, BoxError>) -> Self {
        match outcome {
            Ok(value) => Self {
                hash,
                result: Arc::new(value),
                err: None,
            },
            Err(err) => Self {
                hash,
                result: Arc::new(Value::Null),
                err: Some(Arc::new(err)),
            },
        }
    }

    /// Returns true if the fetch closure failed.
    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

/// Errors surfaced while waiting on a fetch delivery.
///
/// Failures of the fetch closure itself never show up here; those travel
/// inside [`AsyncFetchData::err`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The wait was cancelled before the result was delivered.
    #[error("fetch wait cancelled before delivery")]
    Cancelled,

    /// The delivery channel closed without ever carrying a result.
    #[error("fetch delivery channel closed without a result")]
    ChannelClosed,
}

/// Counters for monitoring coalescing effectiveness.
#[derive(Debug, Default, Clone)]
pub struct FetcherStats {
    /// Total fetch calls received.
    pub total_requests: u64,
    /// Calls that joined in-flight work or hit a settled result.
    pub coalesced_requests: u64,
    /// Calls that triggered a new fetch execution.
    pub new_requests: u64,
}

impl FetcherStats {
    /// Ratio of coalesced calls to total calls (0.0 to 1.0).
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}
