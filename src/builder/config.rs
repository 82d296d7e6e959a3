//! Response builder configuration.

use std::time::Duration;

/// Default wall-clock budget for outstanding node builders.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_millis(2000);

/// Configuration for one [`ResponseBuilder`](super::ResponseBuilder).
#[derive(Clone, Debug)]
pub struct BuilderConfig {
    /// Composition-wide deadline for node builders, measured from the start
    /// of the fan-out. The deadline cancels the build token so cooperative
    /// builders can give up early; it never aborts a builder outright.
    /// `None` disables the deadline entirely.
    pub build_timeout: Option<Duration>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            build_timeout: Some(DEFAULT_BUILD_TIMEOUT),
        }
    }
}

impl BuilderConfig {
    /// Configuration with a specific build deadline.
    pub fn with_build_timeout(timeout: Duration) -> Self {
        Self {
            build_timeout: Some(timeout),
        }
    }

    /// Configuration without a build deadline.
    pub fn without_timeout() -> Self {
        Self {
            build_timeout: None,
        }
    }
}
