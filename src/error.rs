//! Error taxonomy of the kernel.
//!
//! Per-device transport failures are absorbed at the scheduler boundary and
//! only show up in per-device status and backoff state. Configuration errors
//! are returned synchronously to the caller. A `SchedulerError::Fatal` stops
//! the scheduling loop and is surfaced through the status query.

use thiserror::Error;

/// A configuration mutation violated a stated constraint. The previous value
/// stays in effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// Errors from the device registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("device already registered: {0}")]
    AlreadyRegistered(String),
}

/// A poll attempt against a device failed. Recorded against that device only;
/// never aborts the scheduling loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(String),
    #[error("poll timed out")]
    Timeout,
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Http(err.to_string())
        }
    }
}

/// Internal invariant violation. The loop stops and reports `active: false`
/// until an explicit re-initialize.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler fatal: {0}")]
    Fatal(String),
}
