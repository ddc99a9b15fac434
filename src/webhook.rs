//! Webhook notifier: one JSON callback per terminal task.
//!
//! Delivery is best effort. Unreachable endpoints, 429 and 5xx answers are
//! retried with the same [`RetryPolicy`] shape as image descriptions, up to
//! `webhook_max_retries` attempts; other 4xx answers are final. The outcome
//! is reported back for bookkeeping and never touches the task's state.
//!
//! ## Payload
//!
//! ```json
//! {
//!   "task_id": "0190f3c2-…",
//!   "status": "succeeded",
//!   "created_at": "2026-01-01T10:00:00Z",
//!   "started_at": "2026-01-01T10:00:01Z",
//!   "completed_at": "2026-01-01T10:00:09Z",
//!   "outputs": ["0190f3c2-….md", "images/p1-i1.png"]
//! }
//! ```
//!
//! Failed tasks carry `error_code` and `error` instead of `outputs`.

use crate::config::ServiceConfig;
use crate::error::{ServiceError, WebhookError};
use crate::retry::RetryPolicy;
use crate::task::{Task, TaskId, TaskState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Body POSTed to the callback URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub task_id: TaskId,
    pub status: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WebhookPayload {
    pub fn from_task(task: &Task) -> Self {
        let succeeded = task.state == TaskState::Succeeded;
        Self {
            task_id: task.id,
            status: task.state,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            outputs: succeeded.then(|| task.outputs.clone()),
            error_code: task.error_code.clone(),
            error: task.error.clone(),
        }
    }

    /// Value of the `X-Webhook-Event` header, e.g. `task.succeeded`.
    pub fn event(&self) -> String {
        format!("task.{}", self.status)
    }
}

/// What happened to one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: u32,
    pub delivered: bool,
    /// HTTP status of the last answer, if any arrived.
    pub last_status: Option<u16>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Sends terminal-state notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, url: &str, payload: &WebhookPayload) -> DeliveryReport;
}

/// [`Notifier`] over HTTP with `reqwest`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    policy: RetryPolicy,
    max_attempts: u32,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration, policy: RetryPolicy, max_attempts: u32) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            policy,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        Self::new(
            Duration::from_secs(config.webhook_timeout_secs),
            config.webhook_retry_policy(),
            config.webhook_max_retries,
        )
    }

    async fn attempt(&self, url: &str, event: &str, body: &str) -> Result<u16, (Option<u16>, WebhookError)> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", event)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| {
                (
                    None,
                    WebhookError::Unreachable {
                        detail: e.to_string(),
                    },
                )
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err((
                Some(status.as_u16()),
                WebhookError::Rejected {
                    status: status.as_u16(),
                },
            ))
        }
    }
}

/// Whether another attempt could change the outcome.
fn is_retryable(err: &WebhookError) -> bool {
    match err {
        WebhookError::Unreachable { .. } => true,
        WebhookError::Rejected { status } => *status == 429 || *status >= 500,
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, url: &str, payload: &WebhookPayload) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(task_id = %payload.task_id, "Webhook payload not serialisable: {e}");
                return report;
            }
        };
        let event = payload.event();

        loop {
            report.attempts += 1;
            report.last_attempt_at = Some(Utc::now());
            match self.attempt(url, &event, &body).await {
                Ok(status) => {
                    report.delivered = true;
                    report.last_status = Some(status);
                    info!(task_id = %payload.task_id, attempts = report.attempts, "Webhook delivered");
                    return report;
                }
                Err((status, err)) => {
                    report.last_status = status;
                    if !is_retryable(&err) || report.attempts >= self.max_attempts {
                        warn!(
                            task_id = %payload.task_id,
                            attempts = report.attempts,
                            "Giving up on webhook: {err}"
                        );
                        return report;
                    }
                    let delay = self.policy.backoff(report.attempts - 1);
                    warn!(
                        task_id = %payload.task_id,
                        "Webhook attempt {}/{} failed: {err}; retrying in {}ms",
                        report.attempts,
                        self.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
