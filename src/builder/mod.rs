//! Response composition orchestration.
//!
//! The [`ResponseBuilder`] drives one composition: it pre-loads static nodes
//! from storage, fans the remaining node builders out in parallel under a
//! composition-wide deadline, reports progress through two readiness
//! signals, and persists static results back to storage.
//!
//! # Readiness protocol
//!
//! - `required_ready` receives `true` when every required node has settled
//!   without error, or `false` as soon as the first required node fails.
//! - `full_ready` receives `true` when every node settled without error,
//!   `false` when everything settled but something failed, and nothing at
//!   all when the caller's cancellation cut the composition short.
//!
//! Both channels are optional and written with `try_send`: a consumer that
//! never listens cannot stall the build.

mod config;
mod response;
mod slot;

pub use config::{BuilderConfig, DEFAULT_BUILD_TIMEOUT};
pub use response::{BuildCancelled, ResponseBuilder};
