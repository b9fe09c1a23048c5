//! Error types for the engine control plane
//!
//! Errors are split by how callers are expected to react:
//! - transient remote failures (`Dial`, `Timeout`) are retried or recorded per task
//! - resource exhaustion (`PoolExhausted`, `QueueFull`, `QueueClosed`, `PoolClosed`)
//!   means the engine is at a ceiling or shutting down
//! - `UnknownTaskKind` is a programming error in the work registration
//! - `Config` is reported once at startup

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the engine core
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("connection pool exhausted ({limit} live connections)")]
    PoolExhausted { limit: usize },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("task queue is full")]
    QueueFull,

    #[error("task queue is closed")]
    QueueClosed,

    #[error("no handler registered for task kind '{0}'")]
    UnknownTaskKind(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// True for failures caused by the remote side rather than local limits
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Dial { .. } | EngineError::Timeout { .. })
    }

    /// True when a local ceiling or shutdown refused the request
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            EngineError::PoolExhausted { .. }
                | EngineError::PoolClosed
                | EngineError::QueueFull
                | EngineError::QueueClosed
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
