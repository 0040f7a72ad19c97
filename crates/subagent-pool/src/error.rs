//! Typed error taxonomy for the pool's public API (spec §6/§7).
//!
//! Errors are split into transient (caller should retry, optionally after
//! `retry_after`), terminal (caller should not retry), and the sanitizer's
//! partial case, which is not an error at all — a sanitized marker string is
//! returned as a normal result instead.

use std::time::Duration;

/// Stable operation tag attached to every [`AdapterError`], per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterOp {
    Connect,
    Ping,
    Pull,
    Create,
    Start,
    Stop,
    Remove,
    Attach,
    Inspect,
}

impl std::fmt::Display for AdapterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterOp::Connect => "connect",
            AdapterOp::Ping => "ping",
            AdapterOp::Pull => "pull",
            AdapterOp::Create => "create",
            AdapterOp::Start => "start",
            AdapterOp::Stop => "stop",
            AdapterOp::Remove => "remove",
            AdapterOp::Attach => "attach",
            AdapterOp::Inspect => "inspect",
        };
        f.write_str(s)
    }
}

/// Error surfaced by a [`crate::container::ContainerAdapter`] implementation,
/// always tagged with the operation that failed.
#[derive(Debug, thiserror::Error)]
#[error("adapter op={op}: {message}")]
pub struct AdapterError {
    pub op: AdapterOp,
    pub message: String,
}

impl AdapterError {
    pub fn new(op: AdapterOp, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

/// Terminal error codes for [`SubagentError`], per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentErrorCode {
    Draining,
    QueueFull,
    ContainerDead,
    Timeout,
}

impl std::fmt::Display for SubagentErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubagentErrorCode::Draining => "DRAINING",
            SubagentErrorCode::QueueFull => "QUEUE_FULL",
            SubagentErrorCode::ContainerDead => "CONTAINER_DEAD",
            SubagentErrorCode::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// The error type returned by [`crate::executor::execute_task`] and the
/// pool's admission-control gates.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Duration },

    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("{code}")]
    Subagent {
        code: SubagentErrorCode,
        retry: bool,
        retry_after: Option<Duration>,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("task rejected: {0}")]
    Validation(String),
}

impl PoolError {
    pub fn draining() -> Self {
        PoolError::Subagent {
            code: SubagentErrorCode::Draining,
            retry: false,
            retry_after: None,
        }
    }

    pub fn queue_full() -> Self {
        PoolError::Subagent {
            code: SubagentErrorCode::QueueFull,
            retry: false,
            retry_after: None,
        }
    }

    pub fn container_dead() -> Self {
        PoolError::Subagent {
            code: SubagentErrorCode::ContainerDead,
            retry: true,
            retry_after: Some(Duration::from_secs(1)),
        }
    }

    pub fn timeout() -> Self {
        PoolError::Subagent {
            code: SubagentErrorCode::Timeout,
            retry: true,
            retry_after: Some(Duration::from_secs(1)),
        }
    }

    /// Whether a retry is advisable for this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::RateLimit { .. } | PoolError::CircuitOpen { .. } => true,
            PoolError::Subagent { retry, .. } => *retry,
            PoolError::Adapter(_) => false,
            PoolError::Validation(_) => false,
        }
    }
}
