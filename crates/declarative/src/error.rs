//! Error types for reconciliation.
//!
//! Per-key and per-action failures are never raised across a task
//! boundary; they are collected as [`ActionError`](crate::ActionError)
//! records tagged with an [`ErrorKind`]. [`Error`] covers what does
//! propagate: malformed requests rejected before a task exists, and
//! failures of the task machinery itself.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::task::TaskId;
use crate::types::ResourceKey;

/// Categories of reconciliation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An adapter call failed (network, 5xx, rate limit); the batch continues
    TransientExternal,
    /// A declaration is structurally invalid; that key is skipped
    PermanentValidation,
    /// A secret could not be resolved
    SecretResolution,
    /// Unknown task id at poll time
    TaskNotFound,
    /// A blocking poll timed out while the task was still pending
    TimeoutPending,
}

impl ErrorKind {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExternal | Self::TimeoutPending)
    }

    /// Status code used at the request boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::TransientExternal => 502,
            Self::PermanentValidation | Self::SecretResolution => 422,
            Self::TaskNotFound => 404,
            Self::TimeoutPending => 408,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::TransientExternal => "External system call failed",
            Self::PermanentValidation => "Invalid declaration",
            Self::SecretResolution => "Secret could not be resolved",
            Self::TaskNotFound => "Task not found",
            Self::TimeoutPending => "Task still pending",
        }
    }
}

/// Errors returned by [`TaskStore::get_status`](crate::TaskStore::get_status).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The task keeps running and can be polled again
    #[error("task {task_id} still pending after {waited:?}")]
    StillPending { task_id: TaskId, waited: Duration },
}

impl PollError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PollError::NotFound(_) => ErrorKind::TaskNotFound,
            PollError::StillPending { .. } => ErrorKind::TimeoutPending,
        }
    }
}

/// Errors that propagate synchronously to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// The same resource was declared more than once in one request
    #[error("duplicate declaration for {0}")]
    DuplicateKey(ResourceKey),

    /// The request could not be turned into a task
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A terminal record was written twice
    #[error("task {0} already finished")]
    AlreadyFinished(TaskId),

    /// Worker pool could not be created
    #[error("worker pool error: {0}")]
    Pool(String),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Category for errors that map onto the reconciliation taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Poll(e) => Some(e.kind()),
            Error::DuplicateKey(_) | Error::InvalidRequest(_) => {
                Some(ErrorKind::PermanentValidation)
            }
            _ => None,
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
