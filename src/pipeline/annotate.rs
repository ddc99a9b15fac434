//! Page locators and image references for extracted PDF text.
//!
//! The extractor joins page texts with a separator line holding a single
//! form feed. [`annotate`] walks those sections once and, for section `i`:
//!
//! ```text
//! ---                          (before every page but the first)
//!
//! <!-- Page k / N -->          k = min(i + 1, N)
//!
//! {page text}
//!
//! ![pK-i1](images/pK-i1.png)   references for images found on page k
//!
//! Image pK-i1: {description}   once the job has settled
//! ```
//!
//! Locators are HTML comments, invisible once rendered. Image references for
//! pages past the last section are appended at the end so none is lost.
//! Description lines are emitted from the job itself, right after its own
//! reference, so text inside one description can never move another.

use crate::task::{ImageJob, JobStatus};
use once_cell::sync::Lazy;
use regex::Regex;

/// Line separating two pages in extracted text.
pub const PAGE_SEPARATOR: &str = "\u{000C}";

/// Join cleaned page texts into one document with separator lines.
pub fn join_pages<S: AsRef<str>>(pages: &[S]) -> String {
    pages
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(&format!("\n{PAGE_SEPARATOR}\n"))
}

/// `<!-- Page k / n -->`
pub fn page_locator(page: usize, total: usize) -> String {
    format!("<!-- Page {page} / {total} -->")
}

/// `![pK-iN](images/pK-iN.png)`
pub fn image_reference(job: &ImageJob) -> String {
    format!("![{}]({})", job.image_id, job.image_ref)
}

/// Insert page locators and image references into separator-joined text.
///
/// `jobs` must be in document order; a page's references keep that order.
pub fn annotate(text: &str, total_pages: usize, jobs: &[ImageJob]) -> String {
    if total_pages == 0 {
        return text.to_string();
    }

    let sections: Vec<&str> = text.split(&format!("\n{PAGE_SEPARATOR}\n")).collect();
    let mut out = String::with_capacity(text.len() + 64 * (sections.len() + jobs.len()));

    for (i, section) in sections.iter().enumerate() {
        let page = (i + 1).min(total_pages);
        if i > 0 {
            out.push_str("\n---\n\n");
        }
        out.push_str(&page_locator(page, total_pages));
        out.push_str("\n\n");

        let body = section.trim_matches('\n');
        if !body.is_empty() {
            out.push_str(body);
            out.push_str("\n\n");
        }

        // The last section also takes any references for later pages.
        let last = i + 1 == sections.len();
        for job in jobs.iter().filter(|j| j.page == i + 1 || (last && j.page > i + 1)) {
            out.push_str(&image_reference(job));
            out.push_str("\n\n");
            if let Some(line) = description_line(job) {
                out.push_str(&line);
                out.push_str("\n\n");
            }
        }
    }

    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

/// Description line for a settled job.
///
/// `Done` jobs get `Image pK-iN: {description}`; `Failed` jobs get
/// `Image pK-iN: description unavailable ({reason})`. Jobs still pending
/// stay a bare reference.
pub fn description_line(job: &ImageJob) -> Option<String> {
    match job.status {
        JobStatus::Done => Some(format!(
            "Image {}: {}",
            job.image_id,
            job.description.as_deref().unwrap_or("").trim()
        )),
        JobStatus::Failed => Some(format!(
            "Image {}: description unavailable ({})",
            job.image_id,
            job.error.as_deref().unwrap_or("unknown error")
        )),
        JobStatus::Pending | JobStatus::InFlight => None,
    }
}

static RE_LOCATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!-- Page (\d+) / (\d+) -->").unwrap());

/// Every `(page, total)` locator in document order.
pub fn locators(markdown: &str) -> Vec<(usize, usize)> {
    RE_LOCATOR
        .captures_iter(markdown)
        .filter_map(|c| Some((c[1].parse().ok()?, c[2].parse().ok()?)))
        .collect()
}
