//! PDF loading: page text and embedded images via pdfium.
//!
//! pdfium is a C++ library with thread-local state; every call into it runs
//! under `tokio::task::spawn_blocking` so Tokio worker threads never stall on
//! a large document. The backend sits behind [`PdfBackend`] so the rest of
//! the pipeline (and its tests) can run without the native library.

use crate::error::ServiceError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One page as pdfium sees it.
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub text: String,
    /// Embedded raster images in content-stream order.
    pub images: Vec<DynamicImage>,
}

#[derive(Debug, Clone, Default)]
pub struct RawDocument {
    pub pages: Vec<RawPage>,
}

impl RawDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Source of page text and images. `load` is blocking.
pub trait PdfBackend: Send + Sync {
    fn load(&self, bytes: Vec<u8>) -> Result<RawDocument, ServiceError>;
}

/// [`PdfBackend`] using the pdfium shared library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    /// Directory holding the pdfium library; `None` uses the system library.
    lib_dir: Option<PathBuf>,
}

impl PdfiumBackend {
    pub fn new(lib_dir: Option<PathBuf>) -> Self {
        Self { lib_dir }
    }

    fn bind(&self) -> Result<Pdfium, ServiceError> {
        let bindings = match &self.lib_dir {
            Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| ServiceError::Conversion {
            detail: format!("pdfium library unavailable: {e:?}"),
        })?;
        Ok(Pdfium::new(bindings))
    }
}

impl PdfBackend for PdfiumBackend {
    fn load(&self, bytes: Vec<u8>) -> Result<RawDocument, ServiceError> {
        let pdfium = self.bind()?;
        let document =
            pdfium
                .load_pdf_from_byte_vec(bytes, None)
                .map_err(|e| ServiceError::Conversion {
                    detail: format!("unreadable PDF: {e:?}"),
                })?;

        let total = document.pages().len();
        info!("PDF loaded: {} pages", total);

        let mut pages = Vec::with_capacity(total as usize);
        for (idx, page) in document.pages().iter().enumerate() {
            let text = match page.text() {
                Ok(t) => t.all(),
                Err(e) => {
                    warn!("Page {}: no text layer ({:?})", idx + 1, e);
                    String::new()
                }
            };

            let mut images = Vec::new();
            for object in page.objects().iter() {
                let Some(image_object) = object.as_image_object() else {
                    continue;
                };
                match image_object.get_raw_image() {
                    Ok(img) => images.push(img),
                    Err(e) => warn!("Page {}: skipping undecodable image ({:?})", idx + 1, e),
                }
            }

            debug!(
                "Page {}: {} chars, {} images",
                idx + 1,
                text.len(),
                images.len()
            );
            pages.push(RawPage { text, images });
        }

        Ok(RawDocument { pages })
    }
}

/// Run a backend off the async executor.
pub async fn load_document(
    backend: Arc<dyn PdfBackend>,
    bytes: Vec<u8>,
) -> Result<RawDocument, ServiceError> {
    tokio::task::spawn_blocking(move || backend.load(bytes))
        .await
        .map_err(|e| ServiceError::Internal(format!("PDF task panicked: {e}")))?
}
