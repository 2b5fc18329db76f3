use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{queue::QueueError, store::StoreError};

/// Broad error category used for retry decisions and loop-termination
/// handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unsupported state, or an invalid/expired pagination
    /// token.
    Config,
    /// Authentication/authorization failure; terminal for the sync loop.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the homeserver.
    RateLimited,
    /// Task-store or other local persistence failure; fatal to the engine.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal engine bug or invariant break.
    Internal,
}

/// Stable error payload produced by the engine and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct EngineError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl EngineError {
    /// Construct a new engine error.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: impl fmt::Debug, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while the engine is in state {current:?}"),
        )
    }

    /// Whether retrying the failed call may recover.
    ///
    /// Only transient transport conditions qualify; everything else is
    /// surfaced to the owning loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::RateLimited
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        Self::new(ErrorCategory::Storage, "task_store_error", err.to_string())
    }
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        Self::new(ErrorCategory::Internal, "queue_closed", err.to_string())
    }
}

/// Map HTTP status codes to engine error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        429 => ErrorCategory::RateLimited,
        408 | 500..=599 => ErrorCategory::Network,
        400..=499 => ErrorCategory::Config,
        _ => ErrorCategory::Internal,
    }
}
