//! Gateway error types

use std::time::Duration;
use thiserror::Error;

/// Failures of the client connection itself. Always fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
}
