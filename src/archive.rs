//! Zip bundle of a finished task's outputs.
//!
//! Entries keep their manifest paths (`{id}.md`, `images/pK-iN.png`), so the
//! unpacked archive renders exactly like the task directory.

use crate::error::ServiceError;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Build the archive in memory. Blocking; see [`bundle`].
pub fn build_archive(task_dir: &Path, outputs: &[String]) -> Result<Vec<u8>, ServiceError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for rel in outputs {
        let path = task_dir.join(rel);
        let bytes = std::fs::read(&path).map_err(|e| ServiceError::storage(&path, e))?;
        zip.start_file(rel.as_str(), options)
            .map_err(|e| ServiceError::Internal(format!("zip entry '{rel}': {e}")))?;
        zip.write_all(&bytes)
            .map_err(|e| ServiceError::Internal(format!("zip entry '{rel}': {e}")))?;
    }

    let cursor = zip
        .finish()
        .map_err(|e| ServiceError::Internal(format!("zip finalise: {e}")))?;
    Ok(cursor.into_inner())
}

/// [`build_archive`] off the async executor.
pub async fn bundle(task_dir: PathBuf, outputs: Vec<String>) -> Result<Vec<u8>, ServiceError> {
    tokio::task::spawn_blocking(move || build_archive(&task_dir, &outputs))
        .await
        .map_err(|e| ServiceError::Internal(format!("Archive task panicked: {e}")))?
}
