//! System-level error types.
//!
//! Per-connection failures never surface here — they are handled by the
//! owning worker and reported as a close cause. These errors cover the
//! operations a caller invokes directly on the system.

use floodgate_core::ConfigError;
use thiserror::Error;

/// Failure of a system-level operation.
#[derive(Error, Debug)]
pub enum SystemError {
    /// The system was built with zero workers and cannot host connections,
    /// servers, or tasks.
    #[error("io system has no workers")]
    NoWorkers,

    /// Settings failed validation; nothing was started.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An outbound connection could not be established.
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    /// The system (or the component addressed) has shut down.
    #[error("io system is terminated")]
    Terminated,
}
