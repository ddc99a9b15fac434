//! Progress-callback trait for per-image description events.
//!
//! Inject an [`Arc<dyn DescriptionProgressCallback>`] into the
//! [`crate::manager::TaskManager`] to observe the description scheduler as it
//! works through each task's images: forward events to a broadcast channel, a
//! metrics sink or a log, without the scheduler knowing about the host.
//!
//! # Example
//!
//! ```rust
//! use edgequake_md_service::DescriptionProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     described: AtomicUsize,
//! }
//!
//! impl DescriptionProgressCallback for CountingCallback {
//!     fn on_job_complete(&self, task_id: &str, image_id: &str, description_len: usize) {
//!         let done = self.described.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{task_id}: {image_id} described ({description_len} chars), {done} so far");
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the description scheduler as it processes each image job.
///
/// Jobs of one task run concurrently, so every method may be called from
/// several tokio workers at once. Implementations protect shared mutable
/// state with `Mutex` or atomics. All methods default to no-ops.
pub trait DescriptionProgressCallback: Send + Sync {
    /// Called once before any job of the task is scheduled.
    fn on_batch_start(&self, task_id: &str, total_jobs: usize) {
        let _ = (task_id, total_jobs);
    }

    /// Called right before a description call is issued.
    ///
    /// `attempt` is 1-indexed.
    fn on_job_start(&self, task_id: &str, image_id: &str, attempt: u32) {
        let _ = (task_id, image_id, attempt);
    }

    /// Called when an image was described.
    fn on_job_complete(&self, task_id: &str, image_id: &str, description_len: usize) {
        let _ = (task_id, image_id, description_len);
    }

    /// Called after each failed attempt. `will_retry` is false once the job
    /// is settled as failed.
    fn on_job_error(&self, task_id: &str, image_id: &str, error: &str, will_retry: bool) {
        let _ = (task_id, image_id, error, will_retry);
    }

    /// Called once every job is settled (or abandoned after cancellation).
    fn on_batch_complete(&self, task_id: &str, described: usize, failed: usize) {
        let _ = (task_id, described, failed);
    }
}

/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl DescriptionProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn DescriptionProgressCallback>;
