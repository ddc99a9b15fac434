//! Conversion pipeline stages.
//!
//! Each submodule implements one step and is testable on its own; the
//! [`crate::manager`] strings them together per task.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ generic ─────────────────────────────────────────▶ {id}.md
//!   │
//!   └─(PDF)─▶ pdfium ──▶ postprocess ──▶ annotate ──▶ scheduler ──▶ {id}.md
//!            (blocking)    (cleanup)     (locators,    (describe,
//!                                         image refs)   retries)
//! ```
//!
//! 1. [`input`]: size, type, filename and webhook URL checks at submit
//! 2. [`generic`]: text, Markdown, CSV and JSON conversion
//! 3. [`pdfium`]: page text and embedded images; runs in `spawn_blocking`
//! 4. [`postprocess`]: deterministic page-text cleanup
//! 5. [`encode`]: PNG persistence and base64 request payloads
//! 6. [`extract`] / [`annotate`]: page locators and image references
//! 7. [`describe`]: one vision-LLM call per image
//! 8. [`scheduler`]: global concurrency cap, retries and backoff

pub mod annotate;
pub mod describe;
pub mod encode;
pub mod extract;
pub mod generic;
pub mod input;
pub mod pdfium;
pub mod postprocess;
pub mod scheduler;
