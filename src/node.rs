//! Node configuration - the declarative description of one response field.

use crate::fetcher::DynDataFetcher;
use crate::{BoxError, BoxFuture};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Closure that computes one node's value.
///
/// Receives the composition's cancellation token (which also carries the
/// build deadline) and the composition's data fetcher. It must honour
/// cancellation and may call the fetcher any number of times with any
/// fingerprints. Its `Ok` value is stored verbatim as the node's output.
pub type NodeBuilderFn = Arc<
    dyn Fn(CancellationToken, DynDataFetcher) -> BoxFuture<'static, Result<Value, BoxError>>
        + Send
        + Sync,
>;

/// How to build one entry of the composed response.
///
/// `key` must be unique within a composition; duplicates are dropped with a
/// warning, first occurrence winning. A *static* node's value is safe to
/// persist and reuse by later compositions with the same storage key. A
/// *required* node's failure fails the whole composition.
#[derive(Clone)]
pub struct NodeConf {
    /// Response map key this node fills.
    pub key: String,
    /// Whether the value may be persisted to the side-cache.
    pub is_static: bool,
    /// Whether the composition fails if this node fails.
    pub required: bool,
    /// The closure that computes the value.
    pub builder: NodeBuilderFn,
}

impl NodeConf {
    /// Create an optional, non-static node from an async closure.
    pub fn new<F, Fut>(key: impl Into<String>, builder: F) -> Self
    where
        F: Fn(CancellationToken, DynDataFetcher) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            key: key.into(),
            is_static: false,
            required: false,
            builder: Arc::new(move |ctx, fetcher| Box::pin(builder(ctx, fetcher))),
        }
    }

    /// Mark the node as required (or not).
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Mark the node's value as safe to persist (or not).
    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }
}

impl std::fmt::Debug for NodeConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConf")
            .field("key", &self.key)
            .field("is_static", &self.is_static)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}
