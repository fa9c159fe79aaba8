//! Path-based metadata extraction with optional source cleanup.

use std::path::{Path, PathBuf};

use orbital_core::models::ImageMetadata;
use orbital_core::PipelineError;

use crate::image::ImageProcessor;

/// Reads an image resource from disk and returns its flat metadata.
///
/// With `remove_after_processing` set, the resource is deleted once its
/// metadata has been read. A failed extraction never deletes anything.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    remove_after_processing: bool,
}

impl MetadataExtractor {
    pub fn new(remove_after_processing: bool) -> Self {
        Self {
            remove_after_processing,
        }
    }

    pub fn removes_after_processing(&self) -> bool {
        self.remove_after_processing
    }

    /// Whether the resource is gone, e.g. removed by an earlier successful run.
    pub async fn is_missing(path: &Path) -> bool {
        !tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    #[tracing::instrument(skip(self), fields(path = %path.display()))]
    pub async fn extract(&self, path: &Path) -> Result<ImageMetadata, PipelineError> {
        let data = tokio::fs::read(path).await.map_err(|e| {
            PipelineError::Extraction(format!("Cannot open {}: {}", path.display(), e))
        })?;

        let metadata = tokio::task::spawn_blocking(move || ImageProcessor::read_metadata(&data))
            .await
            .map_err(|e| PipelineError::Extraction(format!("Extraction task aborted: {}", e)))??;

        tracing::info!(
            width = metadata.width,
            height = metadata.height,
            format = %metadata.format,
            tags = metadata.tags.len(),
            "Image metadata extracted"
        );

        if self.remove_after_processing {
            self.remove(path.to_path_buf()).await;
        }

        Ok(metadata)
    }

    /// Best-effort removal. The metadata is already in hand, so a failed
    /// delete is logged and does not fail the extraction.
    async fn remove(&self, path: PathBuf) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Source resource removed"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to remove source resource after extraction"
            ),
        }
    }
}
