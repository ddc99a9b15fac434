//! Task manager: owns every task's lifecycle and drives the pipeline.
//!
//! ```text
//! submit ─▶ Queued ─(run slot)─▶ Running ─▶ Succeeded / Failed / Cancelled
//!             │                     │
//!           cancel ─▶ Cancelled   cancel ─▶ token; pipeline stops at the
//!                                           next checkpoint
//! ```
//!
//! Each task runs as its own tokio task. At most `max_concurrent_tasks` are
//! `Running` at once; the rest wait for a run slot and stay cancellable.
//! Image descriptions of all tasks share one [`DescriptionPool`].
//!
//! Every terminal transition fires the webhook exactly once. There are three
//! places a task can become terminal: the end of [`TaskManager::run`], a
//! cancel on a queued task, and start-up recovery of an interrupted task.
//!
//! ## Restart policy
//!
//! Records found `Running` at start-up were interrupted mid-conversion. They
//! are moved to `Failed` with `error_code = "INTERRUPTED"`, partial outputs
//! are removed, and their webhook fires. `Queued` records are scheduled
//! again; terminal records are kept as they are until swept.

use crate::archive;
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::pipeline::annotate::annotate;
use crate::pipeline::describe::{ImageDescriber, LlmImageDescriber};
use crate::pipeline::extract::{extract, Extraction, IMAGES_DIR};
use crate::pipeline::generic;
use crate::pipeline::input::{self, DocumentKind};
use crate::pipeline::pdfium::{PdfBackend, PdfiumBackend};
use crate::pipeline::scheduler::{DescriptionPool, DescriptionScheduler};
use crate::progress::ProgressCallback;
use crate::store::{atomic_write, TaskEntry, TaskStore};
use crate::sweeper::RetentionSweeper;
use crate::task::{ImageJob, Task, TaskId, TaskState};
use crate::webhook::{Notifier, WebhookNotifier, WebhookPayload};
use chrono::Utc;
use std::path::{Component, Path};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Subdirectory of a task holding the uploaded document.
pub const INPUT_DIR: &str = "input";

/// Error code for pipeline failures.
pub const CONVERSION_ERROR: &str = "CONVERSION_ERROR";

/// Error code for tasks interrupted by a restart.
pub const INTERRUPTED: &str = "INTERRUPTED";

/// A document handed to [`TaskManager::submit`].
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub webhook_url: Option<String>,
    pub describe_images: bool,
}

/// How a pipeline run ended short of an error.
enum Completion {
    Done {
        outputs: Vec<String>,
        jobs: Vec<ImageJob>,
    },
    Cancelled {
        jobs: Vec<ImageJob>,
    },
}

struct Inner {
    config: ServiceConfig,
    store: Arc<TaskStore>,
    backend: Arc<dyn PdfBackend>,
    scheduler: Option<DescriptionScheduler>,
    notifier: Arc<dyn Notifier>,
    run_slots: Arc<Semaphore>,
    sweeper: Arc<RetentionSweeper>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Entry point of the service. Cheap to clone.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn builder(config: ServiceConfig) -> TaskManagerBuilder {
        TaskManagerBuilder {
            config,
            backend: None,
            describer: None,
            notifier: None,
            progress: None,
        }
    }

    /// Build with the production pdfium backend, LLM describer and HTTP
    /// notifier, recover persisted tasks and start the sweeper.
    pub async fn start(config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Whether image descriptions can run at all.
    pub fn descriptions_enabled(&self) -> bool {
        self.inner.scheduler.is_some()
    }

    pub fn description_pool(&self) -> Option<&DescriptionPool> {
        self.inner.scheduler.as_ref().map(DescriptionScheduler::pool)
    }

    // ── Operations ────────────────────────────────────────────────────────

    /// Validate and persist a new task in `Queued`, schedule it and return
    /// its id without waiting for conversion.
    pub async fn submit(&self, upload: Upload) -> Result<TaskId, ServiceError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ServiceError::Internal("service is shutting down".into()));
        }
        let size = upload.bytes.len() as u64;
        input::check_size(size, self.inner.config.max_upload_size)?;
        let kind = input::detect_kind(&upload.content_type, &upload.filename, &upload.bytes)?;
        if let Some(ref url) = upload.webhook_url {
            input::validate_webhook_url(url)?;
        }

        let filename = input::sanitize_filename(&upload.filename);
        let content_type = if upload.content_type.trim().is_empty() {
            default_content_type(kind).to_string()
        } else {
            upload.content_type.trim().to_string()
        };

        let id = Uuid::now_v7();
        let dir = self.inner.store.task_dir(id);
        let input_dir = dir.join(INPUT_DIR);
        tokio::fs::create_dir_all(&input_dir)
            .await
            .map_err(|e| ServiceError::storage(&input_dir, e))?;

        let input_path = input_dir.join(&filename);
        if let Err(e) = tokio::fs::write(&input_path, &upload.bytes).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(ServiceError::storage(&input_path, e));
        }

        let mut task = Task::new(id, filename, content_type, size, dir.clone());
        task.webhook_url = upload.webhook_url;
        task.describe_images = upload.describe_images;

        let entry = match self.inner.store.insert(task).await {
            Ok(entry) => entry,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        info!(task_id = %id, kind = ?kind, size, "Task queued");
        self.spawn_run(entry);
        Ok(id)
    }

    /// Snapshot of one task.
    pub async fn status(&self, id: TaskId) -> Result<Task, ServiceError> {
        Ok(self.stamp(self.inner.store.get(id)?.snapshot().await))
    }

    /// Snapshots of every task, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.inner.store.list().await;
        tasks.into_iter().map(|t| self.stamp(t)).collect()
    }

    /// Request cancellation.
    ///
    /// Terminal tasks are returned unchanged. A queued task is cancelled at
    /// once and never starts; a running task gets its token set and reaches
    /// `Cancelled` at its next pipeline checkpoint.
    pub async fn cancel(&self, id: TaskId) -> Result<Task, ServiceError> {
        let entry = self.inner.store.get(id)?;
        let current = entry.snapshot().await;
        if current.state.is_terminal() {
            debug!(task_id = %id, state = %current.state, "Cancel on finished task ignored");
            return Ok(self.stamp(current));
        }

        let now_cancelled = entry
            .update(|t| match t.state {
                TaskState::Queued => t.transition(TaskState::Cancelled, Utc::now()).map(|_| true),
                _ => Ok(false),
            })
            .await?;
        entry.cancel_token().cancel();

        if now_cancelled {
            info!(task_id = %id, "Queued task cancelled");
            self.on_terminal(Arc::clone(&entry));
        } else {
            info!(task_id = %id, "Cancellation requested for running task");
        }
        Ok(self.stamp(entry.snapshot().await))
    }

    /// Remove a finished task and all its files.
    ///
    /// Queued and running tasks are a `Conflict`; cancel them first.
    pub async fn delete(&self, id: TaskId) -> Result<(), ServiceError> {
        let entry = self.inner.store.get(id)?;
        let task = entry.snapshot().await;
        if !task.state.is_terminal() {
            return Err(ServiceError::Conflict {
                task_id: id.to_string(),
                state: task.state.to_string(),
                action: "delete".into(),
            });
        }
        let removed = self
            .inner
            .store
            .remove(id)
            .ok_or_else(|| ServiceError::task_not_found(id))?;
        self.inner.store.purge(&removed).await?;
        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Read one output file of a succeeded task.
    ///
    /// `rel_path` must name an entry of the task's output manifest; anything
    /// else, including any path escaping the task directory, is `NotFound`.
    pub async fn read_output(&self, id: TaskId, rel_path: &str) -> Result<Vec<u8>, ServiceError> {
        let entry = self.inner.store.get(id)?;
        let task = succeeded(&entry).await?;

        let not_found = || ServiceError::NotFound {
            what: format!("File '{rel_path}' of task {id}"),
        };
        if !is_contained(rel_path) || !task.outputs.iter().any(|o| o == rel_path) {
            return Err(not_found());
        }

        let _files = entry.read_files().await;
        let path = entry.dir().join(rel_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(ServiceError::storage(&path, e)),
        }
    }

    /// Zip every output of a succeeded task.
    pub async fn archive(&self, id: TaskId) -> Result<Vec<u8>, ServiceError> {
        let entry = self.inner.store.get(id)?;
        let task = succeeded(&entry).await?;
        let _files = entry.read_files().await;
        if self.inner.store.get(id).is_err() {
            return Err(ServiceError::task_not_found(id));
        }
        archive::bundle(entry.dir().to_path_buf(), task.outputs).await
    }

    /// Run one retention sweep now. Returns how many tasks were removed.
    pub async fn sweep_expired(&self) -> usize {
        self.inner.sweeper.sweep_once(Utc::now()).await
    }

    /// Stop the sweeper and stop starting queued tasks. Running tasks are not
    /// interrupted; queued ones stay `Queued` on disk and resume on restart.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.sweeper.shutdown();
        let handle = self
            .inner
            .sweeper_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Retention sweeper ended abnormally: {e}");
            }
        }
        info!("Task manager stopped");
    }

    /// Fill in the snapshot's sweep deadline.
    fn stamp(&self, mut task: Task) -> Task {
        task.expires_at = task.expiry(self.inner.config.retention_window());
        task
    }

    // ── Execution ─────────────────────────────────────────────────────────

    fn spawn_run(&self, entry: Arc<TaskEntry>) {
        let this = self.clone();
        tokio::spawn(async move { this.run(entry).await });
    }

    /// Wait for a run slot, move the task to `Running`, execute the
    /// pipeline and record the terminal state.
    #[instrument(skip(self, entry), fields(task_id = %entry.id()))]
    async fn run(&self, entry: Arc<TaskEntry>) {
        let cancel = entry.cancel_token().clone();
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = self.inner.shutdown.cancelled() => return,
            permit = Arc::clone(&self.inner.run_slots).acquire_owned() => permit,
        };
        let Ok(_slot) = slot else {
            return;
        };

        // A cancel that got in first leaves the task Cancelled: Conflict here.
        if let Err(e) = entry
            .update(|t| t.transition(TaskState::Running, Utc::now()))
            .await
        {
            debug!("Task not started: {e}");
            return;
        }
        info!("Task running");

        let this = self.clone();
        let worker = Arc::clone(&entry);
        let result = tokio::spawn(async move { this.execute(&worker).await })
            .await
            .unwrap_or_else(|e| Err(ServiceError::Internal(format!("pipeline panicked: {e}"))));

        self.finish(&entry, result).await;
    }

    async fn execute(&self, entry: &TaskEntry) -> Result<Completion, ServiceError> {
        let cancel = entry.cancel_token();
        let task = entry.snapshot().await;
        let dir = entry.dir();

        let input_path = dir.join(INPUT_DIR).join(&task.source_filename);
        let bytes = tokio::fs::read(&input_path)
            .await
            .map_err(|e| ServiceError::storage(&input_path, e))?;
        let kind = input::detect_kind(&task.content_type, &task.source_filename, &bytes)?;

        if cancel.is_cancelled() {
            return Ok(Completion::Cancelled { jobs: Vec::new() });
        }

        let (markdown, jobs) = if kind.is_pdf() {
            let extraction = extract(
                Arc::clone(&self.inner.backend),
                bytes,
                dir,
                self.inner.config.describe_context_chars,
                cancel,
            )
            .await?;
            if cancel.is_cancelled() {
                return Ok(Completion::Cancelled { jobs: Vec::new() });
            }
            self.describe(entry, &task, extraction).await?
        } else {
            let markdown = tokio::task::spawn_blocking(move || generic::convert(kind, &bytes))
                .await
                .map_err(|e| ServiceError::Internal(format!("conversion panicked: {e}")))??;
            (markdown, Vec::new())
        };

        if cancel.is_cancelled() {
            return Ok(Completion::Cancelled { jobs });
        }

        let md_name = markdown_name(task.id);
        atomic_write(&dir.join(&md_name), markdown.into_bytes()).await?;
        let outputs = manifest(dir, &md_name).await?;
        Ok(Completion::Done { outputs, jobs })
    }

    /// Run the description scheduler when the task asked for it and a
    /// provider is available; otherwise images stay bare references.
    async fn describe(
        &self,
        entry: &TaskEntry,
        task: &Task,
        extraction: Extraction,
    ) -> Result<(String, Vec<ImageJob>), ServiceError> {
        let Extraction {
            markdown,
            text,
            images,
            total_pages,
        } = extraction;
        if images.is_empty() || !task.describe_images {
            return Ok((markdown, Vec::new()));
        }
        let Some(ref scheduler) = self.inner.scheduler else {
            warn!(
                task_id = %task.id,
                "Image descriptions requested but no LLM provider is configured"
            );
            return Ok((markdown, Vec::new()));
        };

        let pending = images.clone();
        entry
            .update(|t| {
                t.image_jobs = pending;
                Ok(())
            })
            .await?;

        let (jobs, _) = scheduler
            .run(&task.id.to_string(), entry.dir(), images, entry.cancel_token())
            .await;
        Ok((annotate(&text, total_pages, &jobs), jobs))
    }

    /// Record the terminal state of a run and fire the webhook.
    async fn finish(&self, entry: &Arc<TaskEntry>, result: Result<Completion, ServiceError>) {
        let id = entry.id();
        let recorded = match result {
            Ok(Completion::Done { outputs, jobs }) => {
                entry
                    .update(|t| {
                        t.outputs = outputs;
                        t.image_jobs = jobs;
                        t.transition(TaskState::Succeeded, Utc::now())
                    })
                    .await
            }
            Ok(Completion::Cancelled { jobs }) => {
                discard_outputs(entry.dir(), id).await;
                entry
                    .update(|t| {
                        if !jobs.is_empty() {
                            t.image_jobs = jobs;
                        }
                        t.transition(TaskState::Cancelled, Utc::now())
                    })
                    .await
            }
            Err(e) => {
                warn!(task_id = %id, "Conversion failed: {e}");
                discard_outputs(entry.dir(), id).await;
                entry
                    .update(|t| {
                        t.set_error(CONVERSION_ERROR, &e.to_string());
                        t.transition(TaskState::Failed, Utc::now())
                    })
                    .await
            }
        };

        if let Err(e) = recorded {
            error!(task_id = %id, "Failed to record task outcome: {e}");
            discard_outputs(entry.dir(), id).await;
            entry
                .force(|t| {
                    t.set_error(e.code(), &e.to_string());
                    if let Err(conflict) = t.transition(TaskState::Failed, Utc::now()) {
                        warn!(task_id = %id, "{conflict}");
                    }
                })
                .await;
        }

        let state = entry.snapshot().await.state;
        info!(task_id = %id, state = %state, "Task finished");
        self.on_terminal(Arc::clone(entry));
    }

    /// Fire the webhook for a task that just became terminal.
    fn on_terminal(&self, entry: Arc<TaskEntry>) {
        let this = self.clone();
        tokio::spawn(async move { this.deliver_webhook(&entry).await });
    }

    async fn deliver_webhook(&self, entry: &TaskEntry) {
        let task = entry.snapshot().await;
        let Some(url) = task.webhook_url.as_deref() else {
            return;
        };
        let payload = WebhookPayload::from_task(&task);
        let report = self.inner.notifier.notify(url, &payload).await;

        entry
            .force(|t| {
                t.webhook_attempts += report.attempts;
                t.webhook_last_status = report.last_status;
                t.webhook_last_attempt_at = report.last_attempt_at;
            })
            .await;
    }

    // ── Recovery ──────────────────────────────────────────────────────────

    async fn recover(&self) -> Result<(), ServiceError> {
        let records = self.inner.store.load_records().await?;
        let (mut queued, mut interrupted, mut finished) = (0, 0, 0);

        for task in records {
            let state = task.state;
            let entry = self.inner.store.register(task);
            match state {
                TaskState::Queued => {
                    queued += 1;
                    self.spawn_run(entry);
                }
                TaskState::Running => {
                    interrupted += 1;
                    discard_outputs(entry.dir(), entry.id()).await;
                    let marked = entry
                        .update(|t| {
                            t.set_error(INTERRUPTED, "service restarted while the task was running");
                            t.transition(TaskState::Failed, Utc::now())
                        })
                        .await;
                    if let Err(e) = marked {
                        error!(task_id = %entry.id(), "Failed to record interrupted task: {e}");
                        entry
                            .force(|t| {
                                t.set_error(INTERRUPTED, "service restarted while the task was running");
                                let _ = t.transition(TaskState::Failed, Utc::now());
                            })
                            .await;
                    }
                    self.on_terminal(entry);
                }
                _ => finished += 1,
            }
        }

        if queued + interrupted + finished > 0 {
            info!(queued, interrupted, finished, "Recovered persisted tasks");
        }
        Ok(())
    }
}

/// Builder for [`TaskManager`]; every collaborator can be swapped.
pub struct TaskManagerBuilder {
    config: ServiceConfig,
    backend: Option<Arc<dyn PdfBackend>>,
    describer: Option<Option<Arc<dyn ImageDescriber>>>,
    notifier: Option<Arc<dyn Notifier>>,
    progress: Option<ProgressCallback>,
}

impl TaskManagerBuilder {
    pub fn pdf_backend(mut self, backend: Arc<dyn PdfBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(Some(describer));
        self
    }

    /// Run without image descriptions, whatever the environment offers.
    pub fn without_descriptions(mut self) -> Self {
        self.describer = Some(None);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn build(self) -> Result<TaskManager, ServiceError> {
        let config = self.config;
        let store = Arc::new(TaskStore::new(config.tasks_dir()));

        let backend: Arc<dyn PdfBackend> = match self.backend {
            Some(b) => b,
            None => Arc::new(PdfiumBackend::new(config.pdfium_lib_path.clone())),
        };

        let describer = match self.describer {
            Some(d) => d,
            None => LlmImageDescriber::from_config(&config)?
                .map(|d| Arc::new(d) as Arc<dyn ImageDescriber>),
        };
        let progress = self.progress;
        let scheduler = describer.map(|d| {
            let scheduler = DescriptionScheduler::new(
                DescriptionPool::new(config.max_concurrent_descriptions),
                d,
                config.description_retry_policy(),
                config.description_max_retries,
            );
            match progress {
                Some(p) => scheduler.with_progress(p),
                None => scheduler,
            }
        });

        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(n) => n,
            None => Arc::new(WebhookNotifier::from_config(&config)?),
        };

        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&store),
            config.cleanup_interval(),
            config.retention_window(),
        ));

        let manager = TaskManager {
            inner: Arc::new(Inner {
                run_slots: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
                config,
                store,
                backend,
                scheduler,
                notifier,
                sweeper: Arc::clone(&sweeper),
                sweeper_handle: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        };

        manager.recover().await?;
        let handle = sweeper.start();
        *manager
            .inner
            .sweeper_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handle);

        info!(
            data_dir = %manager.inner.config.data_dir.display(),
            run_slots = manager.inner.config.max_concurrent_tasks,
            description_slots = manager.description_pool().map_or(0, DescriptionPool::capacity),
            "Task manager started"
        );
        Ok(manager)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

async fn succeeded(entry: &TaskEntry) -> Result<Task, ServiceError> {
    let task = entry.snapshot().await;
    if task.state != TaskState::Succeeded {
        return Err(ServiceError::NotFound {
            what: format!("Outputs of task {} ({})", task.id, task.state),
        });
    }
    Ok(task)
}

fn markdown_name(id: TaskId) -> String {
    format!("{id}.md")
}

fn default_content_type(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Pdf => "application/pdf",
        DocumentKind::PlainText => "text/plain",
        DocumentKind::Markdown => "text/markdown",
        DocumentKind::Csv => "text/csv",
        DocumentKind::Json => "application/json",
    }
}

/// Relative, no `..`, no root or drive prefix, no backslashes.
fn is_contained(rel_path: &str) -> bool {
    !rel_path.is_empty()
        && !rel_path.contains('\\')
        && Path::new(rel_path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Output manifest: the Markdown file, then every image sorted by name.
async fn manifest(dir: &Path, md_name: &str) -> Result<Vec<String>, ServiceError> {
    let mut outputs = vec![md_name.to_string()];
    let images_dir = dir.join(IMAGES_DIR);
    let mut read = match tokio::fs::read_dir(&images_dir).await {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(outputs),
        Err(e) => return Err(ServiceError::storage(&images_dir, e)),
    };

    let mut images = Vec::new();
    while let Some(item) = read
        .next_entry()
        .await
        .map_err(|e| ServiceError::storage(&images_dir, e))?
    {
        if let Some(name) = item.file_name().to_str() {
            images.push(format!("{IMAGES_DIR}/{name}"));
        }
    }
    images.sort();
    outputs.extend(images);
    Ok(outputs)
}

/// Remove `{id}.md` and `images/`; the input and record stay.
async fn discard_outputs(dir: &Path, id: TaskId) {
    let md = dir.join(markdown_name(id));
    if let Err(e) = tokio::fs::remove_file(&md).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(task_id = %id, "Failed to remove {}: {e}", md.display());
        }
    }
    let images = dir.join(IMAGES_DIR);
    if let Err(e) = tokio::fs::remove_dir_all(&images).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(task_id = %id, "Failed to remove {}: {e}", images.display());
        }
    }
}
