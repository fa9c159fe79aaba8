//! Document store writer stage.

use std::sync::Arc;

use orbital_core::models::{ImageMetadata, ImageStatus, MetadataDocument};
use orbital_core::PipelineError;
use orbital_db::DocumentStore;
use uuid::Uuid;

use crate::store_error;

/// Persists the metadata document of one record.
#[derive(Clone)]
pub struct DocumentWriter {
    store: Arc<dyn DocumentStore>,
}

impl DocumentWriter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Replace every document of `record_id` with one built from `metadata`.
    ///
    /// Returns the status to propagate down the chain. Safe to redeliver: a
    /// second call with the same arguments still leaves exactly one document.
    #[tracing::instrument(skip(self, metadata), fields(record_id = %record_id))]
    pub async fn write(
        &self,
        record_id: Uuid,
        metadata: ImageMetadata,
    ) -> Result<ImageStatus, PipelineError> {
        let document = MetadataDocument::new(record_id, metadata);
        let removed = self.store.replace(&document).await.map_err(store_error)?;

        if removed > 0 {
            tracing::info!(removed, "Replaced existing metadata document");
        } else {
            tracing::info!("Metadata document stored");
        }
        Ok(ImageStatus::Completed)
    }
}
