//! Error types for the edgequake-md-service library.
//!
//! Three error types reflect three distinct blast radii:
//!
//! * [`ServiceError`]: **Caller-visible**: returned from the task manager
//!   (bad upload, unknown task, incompatible state) or recorded on a task
//!   when its pipeline fails (`ServiceError::Conversion`).
//!
//! * [`DescribeError`]: **Per-image**: one image description call failed.
//!   The scheduler retries transient failures and records the final outcome
//!   on the image job; it never fails the owning task.
//!
//! * [`WebhookError`]: **Per-delivery**: the callback endpoint could not be
//!   reached or rejected the payload. Logged and recorded on the task record,
//!   never surfaced through the task's state.

use std::path::PathBuf;
use thiserror::Error;

/// All caller-visible errors returned by the edgequake-md-service library.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ── Submission errors ─────────────────────────────────────────────────
    /// The upload was rejected before a task was created.
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// The declared content type (or sniffed file type) cannot be converted.
    #[error("Unsupported document type '{content_type}'\nSupported: PDF, plain text, Markdown, CSV, JSON.")]
    UnsupportedType { content_type: String },

    /// The upload exceeds `max_upload_size`.
    #[error("Upload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// Document conversion failed; the owning task goes to `Failed`.
    #[error("Conversion failed: {detail}")]
    Conversion { detail: String },

    // ── Lookup / state errors ─────────────────────────────────────────────
    /// Unknown task, swept task, or missing output file.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The requested action is incompatible with the task's current state.
    #[error("Cannot {action} task {task_id} while it is {state}")]
    Conflict {
        task_id: String,
        state: String,
        action: String,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Reading or writing task files failed.
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ServiceError::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn task_not_found(task_id: impl std::fmt::Display) -> Self {
        ServiceError::NotFound {
            what: format!("Task {task_id}"),
        }
    }

    /// Stable machine-readable code, used for HTTP bodies and task records.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation { .. } => "VALIDATION_ERROR",
            ServiceError::UnsupportedType { .. } => "UNSUPPORTED_TYPE",
            ServiceError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ServiceError::Conversion { .. } => "CONVERSION_ERROR",
            ServiceError::NotFound { .. } => "NOT_FOUND",
            ServiceError::Conflict { .. } => "CONFLICT",
            ServiceError::Storage { .. } => "STORAGE_ERROR",
            ServiceError::InvalidConfig(_) => "INVALID_CONFIG",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Outcome of a single failed image description call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DescribeError {
    /// Network failure, timeout, 5xx or rate limit. Worth retrying.
    #[error("transient: {detail}")]
    Transient { detail: String },

    /// 4xx other than rate limit, malformed or missing image. Never retried.
    #[error("permanent: {detail}")]
    Permanent { detail: String },
}

impl DescribeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DescribeError::Transient { .. })
    }

    pub fn detail(&self) -> &str {
        match self {
            DescribeError::Transient { detail } | DescribeError::Permanent { detail } => detail,
        }
    }
}

/// A single failed webhook delivery attempt.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The endpoint answered with a non-2xx status.
    #[error("webhook endpoint answered HTTP {status}")]
    Rejected { status: u16 },

    /// Connection refused, DNS failure, timeout…
    #[error("webhook endpoint unreachable: {detail}")]
    Unreachable { detail: String },
}
