//! Request-scoped fetch coalescing.
//!
//! When several node builders need the same upstream data during one
//! composition, only one fetch actually runs - every other caller subscribes
//! to the in-flight work and receives the same settled result.
//!
//! # Architecture
//!
//! ```text
//! Builder A ─┐
//!            │                            Background
//! Builder B ─┼──► CoalescingFetcher ────► fetch task
//!            │        │                       │
//! Builder C ─┘        │                       │
//!                     ▼                       ▼
//!               [A, B, C each            [One closure
//!                receive the              invocation]
//!                settled result]◄─────────────┘
//! ```
//!
//! Fingerprints are caller-supplied strings; two requests with equal
//! fingerprints are interchangeable. The cache lives and dies with the
//! fetcher instance, which is expected to be created per composition.

mod coalescer;
mod traits;
mod types;

pub use coalescer::{CoalescingFetcher, FALLBACK_CHANNEL_CAPACITY};
pub use traits::{DataFetcher, DynDataFetcher};
pub use types::{AsyncFetchData, AsyncFetchReq, FetchError, FetchFn, FetcherStats};
