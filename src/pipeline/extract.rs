//! PDF extraction: bytes → annotated Markdown plus one image job per
//! embedded image.
//!
//! ```text
//! bytes ─▶ backend (spawn_blocking) ─▶ clean page text ─▶ save images/pK-iN.png
//!                                                      └▶ join + annotate
//! ```
//!
//! Images are written as they are found. The cancellation token is checked
//! between pages; once it fires, extraction stops early and returns what it
//! has, and the caller's next checkpoint discards it.

use crate::error::ServiceError;
use crate::pipeline::annotate::{annotate, join_pages};
use crate::pipeline::encode::encode_png;
use crate::pipeline::pdfium::{load_document, PdfBackend};
use crate::pipeline::postprocess::clean_page_text;
use crate::task::ImageJob;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Directory (relative to the task directory) holding extracted images.
pub const IMAGES_DIR: &str = "images";

/// Result of extracting one PDF.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Markdown with page locators and bare image references.
    pub markdown: String,
    /// Cleaned page texts joined with separator lines, for re-annotating
    /// once descriptions are in.
    pub text: String,
    /// One job per saved image, in document order.
    pub images: Vec<ImageJob>,
    pub total_pages: usize,
}

/// Extract `bytes` into `task_dir`.
///
/// `context_chars` bounds the page text attached to each image job for
/// grounding: the tail of the image's page and the head of the next one.
pub async fn extract(
    backend: Arc<dyn PdfBackend>,
    bytes: Vec<u8>,
    task_dir: &Path,
    context_chars: usize,
    cancel: &CancellationToken,
) -> Result<Extraction, ServiceError> {
    let document = load_document(backend, bytes).await?;
    let total_pages = document.page_count();
    if total_pages == 0 {
        return Err(ServiceError::Conversion {
            detail: "PDF has no pages".into(),
        });
    }

    let texts: Vec<String> = document
        .pages
        .iter()
        .map(|p| clean_page_text(&p.text))
        .collect();

    let images_dir = task_dir.join(IMAGES_DIR);
    let mut images = Vec::new();
    for (idx, page) in document.pages.into_iter().enumerate() {
        if cancel.is_cancelled() {
            debug!("Extraction stopped at page {} of {}", idx + 1, total_pages);
            break;
        }
        if page.images.is_empty() {
            continue;
        }
        if images.is_empty() {
            tokio::fs::create_dir_all(&images_dir)
                .await
                .map_err(|e| ServiceError::storage(&images_dir, e))?;
        }

        let page_num = idx + 1;
        let pngs = tokio::task::spawn_blocking(move || {
            page.images.iter().map(encode_png).collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("Image encoding panicked: {e}")))?
        .map_err(|e| ServiceError::Conversion {
            detail: format!("page {page_num}: image could not be encoded: {e}"),
        })?;

        let before = tail_chars(&texts[idx], context_chars);
        let after = texts
            .get(idx + 1)
            .map(|t| head_chars(t, context_chars))
            .unwrap_or_default();

        for (n, png) in pngs.into_iter().enumerate() {
            let image_id = format!("p{}-i{}", page_num, n + 1);
            let image_ref = format!("{IMAGES_DIR}/{image_id}.png");
            let path = task_dir.join(&image_ref);
            tokio::fs::write(&path, png)
                .await
                .map_err(|e| ServiceError::storage(&path, e))?;
            images.push(ImageJob::new(image_id, image_ref, page_num).with_context(&before, &after));
        }
    }

    let text = join_pages(&texts);
    let markdown = annotate(&text, total_pages, &images);
    info!(
        "Extracted {} pages, {} images",
        total_pages,
        images.len()
    );

    Ok(Extraction {
        markdown,
        text,
        images,
        total_pages,
    })
}

fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(n)).collect()
}

fn head_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::annotate::locators;
    use crate::pipeline::pdfium::{RawDocument, RawPage};
    use image::{DynamicImage, Rgba, RgbaImage};
    use tempfile::TempDir;

    struct Pages(Vec<(String, usize)>);

    impl PdfBackend for Pages {
        fn load(&self, _bytes: Vec<u8>) -> Result<RawDocument, ServiceError> {
            Ok(RawDocument {
                pages: self
                    .0
                    .iter()
                    .map(|(text, n)| RawPage {
                        text: text.clone(),
                        images: (0..*n)
                            .map(|_| {
                                DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                                    4,
                                    4,
                                    Rgba([0, 0, 255, 255]),
                                ))
                            })
                            .collect(),
                    })
                    .collect(),
            })
        }
    }

    fn backend(pages: &[(&str, usize)]) -> Arc<dyn PdfBackend> {
        Arc::new(Pages(
            pages.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
        ))
    }

    #[tokio::test]
    async fn three_pages_two_images_on_page_two() {
        let tmp = TempDir::new().unwrap();
        let b = backend(&[("Intro", 0), ("Results below.", 2), ("Conclusion", 0)]);
        let out = extract(b, b"%PDF".to_vec(), tmp.path(), 500, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.total_pages, 3);
        assert_eq!(locators(&out.markdown), vec![(1, 3), (2, 3), (3, 3)]);
        let ids: Vec<_> = out.images.iter().map(|j| j.image_id.as_str()).collect();
        assert_eq!(ids, ["p2-i1", "p2-i2"]);
        assert!(tmp.path().join("images/p2-i1.png").exists());
        assert!(tmp.path().join("images/p2-i2.png").exists());

        let job = &out.images[0];
        assert_eq!(job.context_before, "Results below.");
        assert_eq!(job.context_after, "Conclusion");
        assert!(out.markdown.contains("![p2-i1](images/p2-i1.png)"));
    }

    #[tokio::test]
    async fn zero_pages_is_a_conversion_error() {
        let tmp = TempDir::new().unwrap();
        let err = extract(backend(&[]), Vec::new(), tmp.path(), 500, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONVERSION_ERROR");
    }

    #[tokio::test]
    async fn no_images_still_gets_locators() {
        let tmp = TempDir::new().unwrap();
        let out = extract(backend(&[("a", 0), ("b", 0)]), Vec::new(), tmp.path(), 500, &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.images.is_empty());
        assert_eq!(locators(&out.markdown).len(), 2);
        assert!(!tmp.path().join(IMAGES_DIR).exists());
    }

    #[tokio::test]
    async fn cancelled_extraction_saves_nothing() {
        let tmp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = extract(backend(&[("a", 1)]), Vec::new(), tmp.path(), 500, &cancel)
            .await
            .unwrap();
        assert!(out.images.is_empty());
    }

    #[test]
    fn context_is_bounded_by_chars() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
        assert_eq!(head_chars("héllo wörld", 2), "hé");
        assert_eq!(tail_chars("ab", 10), "ab");
    }
}
