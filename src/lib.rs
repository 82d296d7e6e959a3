//! DataBlocks - concurrent response composition
//!
//! This library assembles one keyed response object from a declarative list
//! of *nodes*. Every node names one field of the result and carries a
//! builder closure that computes it; the engine runs all builders in
//! parallel, enforces a composition-wide deadline, and reports progress
//! through two readiness signals (required nodes done / everything done).
//!
//! Builders pull their inputs through a request-scoped
//! [`CoalescingFetcher`](fetcher::CoalescingFetcher): concurrent fetches
//! sharing a fingerprint execute once, and every subscriber receives the
//! settled result. Nodes flagged as static are persisted to a pluggable
//! [`KeyValStorage`](storage::KeyValStorage) so later compositions with the
//! same storage key can skip recomputation entirely.
//!
//! # High-Level API
//!
//! ```ignore
//! use datablocks::builder::{BuilderConfig, ResponseBuilder};
//! use datablocks::fetcher::CoalescingFetcher;
//! use datablocks::node::NodeConf;
//! use datablocks::storage::InMemKeyValStorage;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let fetcher = Arc::new(CoalescingFetcher::new(nodes.len()));
//! let storage = Arc::new(InMemKeyValStorage::new());
//! let builder = ResponseBuilder::new("req-42", storage, fetcher, nodes, BuilderConfig::default());
//!
//! let (required_tx, mut required_rx) = mpsc::channel(1);
//! builder.build(CancellationToken::new(), Some(required_tx), None);
//!
//! if required_rx.recv().await == Some(true) {
//!     let response = builder.result();
//! }
//! ```

pub mod builder;
pub mod fetcher;
pub mod node;
pub mod storage;

use std::future::Future;
use std::pin::Pin;

/// Boxed future alias used by the storage and fetcher seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type produced by user-supplied builder and fetch closures.
///
/// The engine never inspects these beyond logging and counting; they are
/// carried verbatim to whoever reads the node slot or fetch result.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Version of the DataBlocks library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
