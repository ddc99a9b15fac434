//! Task data model and its state machine.
//!
//! ```text
//! Queued ──▶ Running ──▶ Succeeded
//!   │           ├──────▶ Failed
//!   │           └──────▶ Cancelled
//!   └──────────────────▶ Cancelled
//! ```
//!
//! Every state change goes through [`Task::transition`]; nothing else writes
//! `Task::state`. Terminal states never transition again; the only way out
//! is deletion of the whole record.

use crate::error::ServiceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Opaque, time-sortable task identifier (UUIDv7).
pub type TaskId = Uuid;

/// Longest `error` message kept on a task record.
pub const MAX_ERROR_LEN: usize = 500;

/// Lifecycle state of a conversion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one image description job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// One extracted image waiting for (or carrying) an LLM description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageJob {
    /// Stable id used in the Markdown reference, e.g. `p2-i1`.
    pub image_id: String,
    /// Path relative to the task directory, e.g. `images/p2-i1.png`.
    pub image_ref: String,
    /// 1-indexed page the image was found on.
    pub page: usize,
    pub attempt_count: u32,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Page text preceding the image, sent to the model as grounding.
    #[serde(skip)]
    pub context_before: String,
    /// Page text following the image.
    #[serde(skip)]
    pub context_after: String,
}

impl ImageJob {
    pub fn new(image_id: impl Into<String>, image_ref: impl Into<String>, page: usize) -> Self {
        Self {
            image_id: image_id.into(),
            image_ref: image_ref.into(),
            page,
            attempt_count: 0,
            status: JobStatus::Pending,
            description: None,
            error: None,
            context_before: String::new(),
            context_after: String::new(),
        }
    }

    pub fn with_context(mut self, before: impl Into<String>, after: impl Into<String>) -> Self {
        self.context_before = before.into();
        self.context_after = after.into();
        self
    }
}

/// A document-conversion request and its lifecycle. Cloned out of the
/// registry as a snapshot for status lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    pub source_filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub describe_images: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    pub output_dir: PathBuf,
    /// Output files relative to `output_dir`; filled on success.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub image_jobs: Vec<ImageJob>,
    #[serde(default)]
    pub webhook_attempts: u32,
    #[serde(default)]
    pub webhook_last_status: Option<u16>,
    #[serde(default)]
    pub webhook_last_attempt_at: Option<DateTime<Utc>>,
    /// When the sweeper may reclaim the task. Derived on every snapshot
    /// handed out; never set while the task is live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A new task in `Queued`.
    pub fn new(
        id: TaskId,
        source_filename: impl Into<String>,
        content_type: impl Into<String>,
        size_bytes: u64,
        output_dir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: TaskState::Queued,
            source_filename: source_filename.into(),
            content_type: content_type.into(),
            size_bytes,
            describe_images: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            webhook_url: None,
            error: None,
            error_code: None,
            output_dir,
            outputs: Vec::new(),
            image_jobs: Vec::new(),
            webhook_attempts: 0,
            webhook_last_status: None,
            webhook_last_attempt_at: None,
            expires_at: None,
        }
    }

    /// Apply a state change, rejecting edges the state machine does not have.
    ///
    /// Stamps `started_at` on entering `Running` and `completed_at` on
    /// entering any terminal state.
    pub fn transition(&mut self, next: TaskState, now: DateTime<Utc>) -> Result<(), ServiceError> {
        if !self.state.can_transition_to(next) {
            return Err(ServiceError::Conflict {
                task_id: self.id.to_string(),
                state: self.state.to_string(),
                action: format!("move to {next}"),
            });
        }
        self.state = next;
        self.updated_at = now;
        if next == TaskState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Record the failure cause. Only meaningful right before a transition to
    /// [`TaskState::Failed`].
    pub fn set_error(&mut self, code: &str, message: &str) {
        let mut message = message.to_string();
        if message.len() > MAX_ERROR_LEN {
            let mut cut = MAX_ERROR_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        self.error_code = Some(code.to_string());
        self.error = Some(message);
    }

    /// Instant retention age is measured from.
    pub fn retention_anchor(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    /// Instant the task becomes eligible for sweeping, or `None` while it is
    /// queued or running.
    pub fn expiry(&self, window: Duration) -> Option<DateTime<Utc>> {
        if !self.state.is_terminal() {
            return None;
        }
        let window = chrono::Duration::from_std(window).ok()?;
        self.retention_anchor().checked_add_signed(window)
    }

    /// Whether the sweeper may reclaim this task at `now`.
    ///
    /// Only terminal tasks qualify; queued and running work is never swept.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        let Ok(window) = chrono::Duration::from_std(window) else {
            return false;
        };
        now.signed_duration_since(self.retention_anchor()) >= window
    }
}
