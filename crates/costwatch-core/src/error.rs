//! Error types for the monitor.
//!
//! Every per-cycle error is recoverable: the scheduler logs it and tries
//! again on the next tick. Only `LockUnavailable` (and lock/state IO at
//! startup) ends a run.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Failure to obtain a usage snapshot
#[derive(Debug, Error)]
pub enum FetchError {
    /// Another fetch held the single-flight guard for too long
    #[error("usage fetch already in flight; gave up after {waited:?}")]
    GuardTimeout { waited: Duration },

    /// The usage command produced more output than allowed
    #[error("usage output exceeded {limit} bytes")]
    TooLarge { limit: usize },

    /// The usage command output did not match the expected document
    #[error("malformed usage output: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The usage command did not finish in time
    #[error("usage command timed out after {after:?}")]
    Timeout { after: Duration },

    /// The usage command could not be started
    #[error("failed to start usage command: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading the usage command output failed
    #[error("failed to read usage output: {0}")]
    Io(#[source] std::io::Error),

    /// The usage command exited unsuccessfully
    #[error("usage command exited with {status}")]
    CommandFailed { status: ExitStatus },
}

/// Failure to deliver an alert
#[derive(Debug, Error)]
pub enum SinkError {
    /// The endpoint answered with a non-success status
    #[error("webhook responded with status {code}")]
    Status { code: u16 },

    /// The request never got a response (connect, TLS, timeout)
    #[error("webhook request failed: {0}")]
    Transport(String),

    /// The blocking delivery task panicked or was cancelled
    #[error("webhook task failed: {0}")]
    Join(String),
}

/// Top-level error for a check cycle or a scheduler run
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Delivery failed; the notification date was not advanced
    #[error("notification delivery failed: {0}")]
    SinkDeliveryFailed(#[from] SinkError),

    /// A live process already holds the instance lock
    #[error("another costwatch instance holds lock '{name}'")]
    LockUnavailable { name: String },

    #[error("instance lock error: {0}")]
    Lock(#[source] anyhow::Error),

    #[error("state store error: {0}")]
    State(#[source] anyhow::Error),
}

impl MonitorError {
    /// Process exit code for this error class
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Fetch(_) => 3,
            Self::SinkDeliveryFailed(_) => 4,
            Self::LockUnavailable { .. } => 5,
            Self::Lock(_) | Self::State(_) => 6,
        }
    }
}
