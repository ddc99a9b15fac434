//! Image encoding: extracted `DynamicImage` → PNG bytes on disk, and PNG
//! bytes → base64 `ImageData` for the description request.
//!
//! Images are stored as PNG whatever their original encoding inside the PDF.
//! Lossless output keeps fine print legible for the vision model, and a
//! single format keeps `images/` references predictable.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an extracted image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded {}x{} image → {} bytes PNG", img.width(), img.height(), buf.len());
    Ok(buf)
}

/// Wrap stored PNG bytes for a multimodal chat request.
///
/// `detail: "high"` lets GPT-4-class models tile the image instead of
/// reading a single downscaled overview.
pub fn to_image_data(png: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(png), "image/png").with_detail("high")
}
