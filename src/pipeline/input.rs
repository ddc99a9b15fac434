//! Upload validation: size, document kind, filename and webhook URL.
//!
//! Runs before a task exists, so every failure here is a submission error
//! that never enters the state machine.

use crate::error::ServiceError;
use std::path::Path;
use tracing::debug;

/// Longest sanitised filename in bytes.
const MAX_FILENAME_LEN: usize = 255;

/// What the pipeline does with an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    PlainText,
    Markdown,
    Csv,
    Json,
}

impl DocumentKind {
    pub fn is_pdf(self) -> bool {
        self == DocumentKind::Pdf
    }
}

/// Reject uploads over the configured limit and empty uploads.
pub fn check_size(size: u64, limit: u64) -> Result<(), ServiceError> {
    if size == 0 {
        return Err(ServiceError::Validation {
            reason: "uploaded file is empty".into(),
        });
    }
    if size > limit {
        return Err(ServiceError::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Decide how to convert an upload.
///
/// PDFs are recognised by declared type, `.pdf` extension or the `%PDF`
/// magic bytes, in that order; a PDF that arrives as
/// `application/octet-stream` is still a PDF. Everything else is matched on
/// the declared type first and the extension second.
pub fn detect_kind(
    content_type: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<DocumentKind, ServiceError> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if mime == "application/pdf" || ext == "pdf" || bytes.starts_with(b"%PDF") {
        return Ok(DocumentKind::Pdf);
    }

    let kind = match mime.as_str() {
        "text/plain" => Some(DocumentKind::PlainText),
        "text/markdown" | "text/x-markdown" => Some(DocumentKind::Markdown),
        "text/csv" => Some(DocumentKind::Csv),
        "application/json" => Some(DocumentKind::Json),
        _ => None,
    }
    .or(match ext.as_str() {
        "txt" | "text" | "log" => Some(DocumentKind::PlainText),
        "md" | "markdown" => Some(DocumentKind::Markdown),
        "csv" => Some(DocumentKind::Csv),
        "json" => Some(DocumentKind::Json),
        _ => None,
    });

    match kind {
        Some(kind) => {
            debug!("Detected {:?} for '{}' ({})", kind, filename, content_type);
            Ok(kind)
        }
        None => Err(ServiceError::UnsupportedType {
            content_type: if mime.is_empty() {
                format!("unknown (.{ext})")
            } else {
                mime
            },
        }),
    }
}

/// Reduce a client-supplied filename to a safe basename.
///
/// Directory components are dropped, anything outside `[A-Za-z0-9._-]`
/// becomes `_`, leading dots are stripped so the result is never hidden or
/// `..`, and the name is capped at 255 bytes.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let mut name: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    name = name.trim_start_matches('.').to_string();
    name.truncate(MAX_FILENAME_LEN);
    if name.is_empty() {
        "document".to_string()
    } else {
        name
    }
}

/// Accept only absolute http(s) URLs with a host.
pub fn validate_webhook_url(url: &str) -> Result<(), ServiceError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ServiceError::Validation {
        reason: format!("webhook_url is not a valid URL: {e}"),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ServiceError::Validation {
            reason: format!("webhook_url scheme must be http or https, got '{}'", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ServiceError::Validation {
            reason: "webhook_url must include a host".into(),
        });
    }
    Ok(())
}
