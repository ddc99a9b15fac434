//! Description scheduler: drives a task's image jobs under a process-wide
//! concurrency ceiling.
//!
//! ## Admission
//!
//! [`DescriptionPool`] wraps one `tokio::sync::Semaphore` shared by every
//! task. Tokio's semaphore queues waiters in FIFO order, so a task with many
//! images cannot starve later tasks. A slot is an owned permit: it is
//! released when dropped, on every exit path.
//!
//! ## Attempts
//!
//! ```text
//! acquire slot ─▶ describe ─▶ release slot ─┬─ Ok ─────────────▶ Done
//!      ▲                                    ├─ Permanent ──────▶ Failed
//!      │                                    ├─ Transient, last ▶ Failed
//!      └────────── backoff sleep ◀──────────┘─ Transient
//! ```
//!
//! Image bytes are read only once a slot is held and dropped with it, so
//! memory follows the pool size rather than the number of images. The
//! backoff sleep happens with no slot held. Once the task's cancellation
//! token fires, calls already in flight complete but no job starts a new
//! attempt; unstarted jobs stay `Pending`.

use crate::error::DescribeError;
use crate::pipeline::describe::{DescribeContext, ImageDescriber};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::retry::RetryPolicy;
use crate::task::{ImageJob, JobStatus};
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded admission gate for outbound description calls.
#[derive(Clone)]
pub struct DescriptionPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl DescriptionPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot. `None` only if the semaphore was closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).acquire_owned().await.ok()
    }
}

/// Counts after a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub described: usize,
    pub failed: usize,
    /// Jobs left `Pending` because the task was cancelled.
    pub abandoned: usize,
}

pub struct DescriptionScheduler {
    pool: DescriptionPool,
    describer: Arc<dyn ImageDescriber>,
    policy: RetryPolicy,
    max_attempts: u32,
    progress: ProgressCallback,
}

impl DescriptionScheduler {
    pub fn new(
        pool: DescriptionPool,
        describer: Arc<dyn ImageDescriber>,
        policy: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            pool,
            describer,
            policy,
            max_attempts: max_attempts.max(1),
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn pool(&self) -> &DescriptionPool {
        &self.pool
    }

    /// Drive every job to `Done` or `Failed` (or leave it `Pending` after
    /// cancellation). Jobs complete in any order; the returned vector keeps
    /// the input order.
    ///
    /// `task_dir` is the directory `ImageJob::image_ref` is relative to.
    pub async fn run(
        &self,
        task_id: &str,
        task_dir: &Path,
        jobs: Vec<ImageJob>,
        cancel: &CancellationToken,
    ) -> (Vec<ImageJob>, BatchOutcome) {
        self.progress.on_batch_start(task_id, jobs.len());
        info!(task_id, jobs = jobs.len(), "Describing images");

        let jobs = join_all(
            jobs.into_iter()
                .map(|job| self.drive(task_id, task_dir, job, cancel)),
        )
        .await;

        let mut outcome = BatchOutcome::default();
        for job in &jobs {
            match job.status {
                JobStatus::Done => outcome.described += 1,
                JobStatus::Failed => outcome.failed += 1,
                JobStatus::Pending | JobStatus::InFlight => outcome.abandoned += 1,
            }
        }
        self.progress
            .on_batch_complete(task_id, outcome.described, outcome.failed);
        info!(
            task_id,
            described = outcome.described,
            failed = outcome.failed,
            abandoned = outcome.abandoned,
            "Image descriptions settled"
        );
        (jobs, outcome)
    }

    async fn drive(
        &self,
        task_id: &str,
        task_dir: &Path,
        mut job: ImageJob,
        cancel: &CancellationToken,
    ) -> ImageJob {
        let context = DescribeContext {
            before: job.context_before.clone(),
            after: job.context_after.clone(),
        };

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return job,
                permit = self.pool.acquire() => permit,
            };
            let Some(permit) = permit else {
                let err = DescribeError::Permanent {
                    detail: "description pool closed".into(),
                };
                self.settle_failed(task_id, &mut job, &err);
                return job;
            };

            // Read under the slot so only `capacity` images sit in memory.
            let image = match tokio::fs::read(task_dir.join(&job.image_ref)).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    drop(permit);
                    let err = DescribeError::Permanent {
                        detail: format!("image unreadable: {e}"),
                    };
                    self.settle_failed(task_id, &mut job, &err);
                    return job;
                }
            };

            job.status = JobStatus::InFlight;
            job.attempt_count += 1;
            self.progress
                .on_job_start(task_id, &job.image_id, job.attempt_count);
            debug!(task_id, image = %job.image_id, attempt = job.attempt_count, "Describing image");

            let result = self.describer.describe(&image, &context).await;
            drop(image);
            drop(permit);

            let err = match result {
                Ok(description) => {
                    self.progress
                        .on_job_complete(task_id, &job.image_id, description.len());
                    job.status = JobStatus::Done;
                    job.description = Some(description);
                    job.error = None;
                    return job;
                }
                Err(err) => err,
            };

            let retryable = err.is_transient() && job.attempt_count < self.max_attempts;
            if !retryable {
                self.settle_failed(task_id, &mut job, &err);
                return job;
            }
            if cancel.is_cancelled() {
                job.status = JobStatus::Pending;
                job.error = Some(err.detail().to_string());
                return job;
            }

            self.progress
                .on_job_error(task_id, &job.image_id, err.detail(), true);
            job.status = JobStatus::Pending;
            job.error = Some(err.detail().to_string());
            let delay = self.policy.backoff(job.attempt_count - 1);
            warn!(
                task_id,
                image = %job.image_id,
                "Attempt {}/{} failed: {}; retrying in {}ms",
                job.attempt_count,
                self.max_attempts,
                err.detail(),
                delay.as_millis()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return job,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn settle_failed(&self, task_id: &str, job: &mut ImageJob, err: &DescribeError) {
        warn!(
            task_id,
            image = %job.image_id,
            attempts = job.attempt_count,
            "Image description failed: {}",
            err
        );
        self.progress
            .on_job_error(task_id, &job.image_id, err.detail(), false);
        job.status = JobStatus::Failed;
        job.error = Some(err.detail().to_string());
    }
}
