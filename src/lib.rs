//! # edgequake-md-service
//!
//! Asynchronous document-to-Markdown conversion as a task service.
//!
//! Clients submit a document and get a task id back at once. The document is
//! converted in the background; PDFs have their page text extracted through
//! pdfium, their embedded images saved and, on request, described by a
//! vision LLM. When a task finishes, an optional webhook is called. Finished
//! tasks are kept for a retention window and then swept.
//!
//! ## Task Lifecycle
//!
//! ```text
//! submit ─▶ Queued ─▶ Running ─┬─▶ Succeeded   {id}.md + images/
//!             │          │     ├─▶ Failed      error_code + error
//!             └──────────┴─────┴─▶ Cancelled
//!                                     │
//!                                     ├─ webhook (once)
//!                                     └─ swept after retention_hours
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_md_service::{ServiceConfig, TaskManager, Upload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder().data_dir("./data").build()?;
//!     let manager = TaskManager::start(config).await?;
//!
//!     let id = manager
//!         .submit(Upload {
//!             filename: "report.pdf".into(),
//!             content_type: "application/pdf".into(),
//!             bytes: std::fs::read("report.pdf")?,
//!             webhook_url: Some("https://example.com/hooks/md".into()),
//!             describe_images: true,
//!         })
//!         .await?;
//!
//!     println!("{}", manager.status(id).await?.state);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `md-service` HTTP binary (axum + clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` to embed the task manager without the HTTP surface:
//! ```toml
//! edgequake-md-service = { version = "0.1", default-features = false }
//! ```
//!
//! ## Image Descriptions
//!
//! The description provider is resolved through `edgequake-llm`: an
//! explicit `provider`, then `provider_name` + `model`, then the
//! `EDGEQUAKE_LLM_PROVIDER` / `EDGEQUAKE_MODEL` pair, then whichever API key
//! is present in the environment. Without any, images are still extracted
//! and referenced, only not described.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod archive;
pub mod config;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
#[cfg(feature = "cli")]
pub mod server;
pub mod store;
pub mod sweeper;
pub mod task;
pub mod webhook;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use error::{DescribeError, ServiceError, WebhookError};
pub use manager::{TaskManager, TaskManagerBuilder, Upload};
pub use pipeline::describe::{DescribeContext, ImageDescriber, LlmImageDescriber};
pub use pipeline::pdfium::{PdfBackend, PdfiumBackend, RawDocument, RawPage};
pub use progress::{DescriptionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use retry::RetryPolicy;
pub use task::{ImageJob, JobStatus, Task, TaskId, TaskState};
pub use webhook::{DeliveryReport, Notifier, WebhookNotifier, WebhookPayload};
