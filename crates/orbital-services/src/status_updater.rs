//! Status updater stage with a terminal-status guard.

use std::sync::Arc;

use orbital_core::models::ImageStatus;
use orbital_core::PipelineError;
use orbital_db::ImageRecordStore;
use uuid::Uuid;

use crate::store_error;

/// Statuses a record may still move away from.
const NON_TERMINAL: [ImageStatus; 2] = [ImageStatus::Pending, ImageStatus::Processing];

/// What a status update did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied { previous: ImageStatus },
    /// The record already had the requested status.
    Unchanged,
    /// The record is terminal with a different status; nothing was written.
    Conflict { current: ImageStatus },
}

impl StatusUpdate {
    pub fn label(&self) -> &'static str {
        match self {
            StatusUpdate::Applied { .. } => "applied",
            StatusUpdate::Unchanged => "unchanged",
            StatusUpdate::Conflict { .. } => "conflict",
        }
    }
}

#[derive(Clone)]
pub struct StatusUpdater {
    records: Arc<dyn ImageRecordStore>,
}

impl StatusUpdater {
    pub fn new(records: Arc<dyn ImageRecordStore>) -> Self {
        Self { records }
    }

    /// Validate `literal` and persist it on the record.
    ///
    /// A terminal status is never overwritten. An invalid literal fails before
    /// the store is touched.
    #[tracing::instrument(skip(self), fields(record_id = %record_id))]
    pub async fn set_status(
        &self,
        literal: &str,
        record_id: Uuid,
    ) -> Result<StatusUpdate, PipelineError> {
        let status: ImageStatus = literal.parse()?;
        self.apply(status, record_id).await
    }

    pub async fn apply(
        &self,
        status: ImageStatus,
        record_id: Uuid,
    ) -> Result<StatusUpdate, PipelineError> {
        let applied = self
            .records
            .update_status_from(record_id, &NON_TERMINAL, status)
            .await
            .map_err(store_error)?;

        if let Some(previous) = applied {
            if previous == status {
                return Ok(StatusUpdate::Unchanged);
            }
            tracing::info!(from = %previous, to = %status, "Record status updated");
            return Ok(StatusUpdate::Applied { previous });
        }

        let record = self
            .records
            .get(record_id)
            .await
            .map_err(store_error)?
            .ok_or(PipelineError::NotFound(record_id))?;

        if record.status == status {
            tracing::debug!(status = %status, "Record already has requested status");
            Ok(StatusUpdate::Unchanged)
        } else {
            tracing::warn!(
                current = %record.status,
                requested = %status,
                "Status conflict: record is already terminal, update ignored"
            );
            Ok(StatusUpdate::Conflict {
                current: record.status,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbital_core::models::ImageRecord;
    use orbital_db::MemoryImageRecordStore;

    async fn setup(status: ImageStatus) -> (MemoryImageRecordStore, StatusUpdater, Uuid) {
        let store = MemoryImageRecordStore::new();
        let mut record = ImageRecord::new("pic.jpg", Uuid::new_v4());
        record.status = status;
        let id = record.id;
        store.insert(record).await;
        let updater = StatusUpdater::new(Arc::new(store.clone()));
        (store, updater, id)
    }

    #[tokio::test]
    async fn applies_valid_status() {
        let (store, updater, id) = setup(ImageStatus::Processing).await;
        let outcome = updater.set_status("COMPLETED", id).await.unwrap();
        assert_eq!(
            outcome,
            StatusUpdate::Applied {
                previous: ImageStatus::Processing
            }
        );
        assert_eq!(store.status_of(id).await, Some(ImageStatus::Completed));
    }

    #[tokio::test]
    async fn rejects_invalid_literal_without_mutation() {
        let (store, updater, id) = setup(ImageStatus::Pending).await;
        for literal in ["DONE", "completed", ""] {
            let err = updater.set_status(literal, id).await.unwrap_err();
            assert!(matches!(err, PipelineError::InvalidStatus(_)));
            assert!(!err.is_compensable());
        }
        assert_eq!(store.status_of(id).await, Some(ImageStatus::Pending));
    }

    #[tokio::test]
    async fn unknown_record_is_not_found() {
        let (_, updater, _) = setup(ImageStatus::Pending).await;
        let missing = Uuid::new_v4();
        let err = updater.set_status("FAILED", missing).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn same_terminal_status_is_noop() {
        let (store, updater, id) = setup(ImageStatus::Failed).await;
        let outcome = updater.set_status("FAILED", id).await.unwrap();
        assert_eq!(outcome, StatusUpdate::Unchanged);
        assert_eq!(store.status_of(id).await, Some(ImageStatus::Failed));
    }

    #[tokio::test]
    async fn different_terminal_status_is_conflict() {
        let (store, updater, id) = setup(ImageStatus::Completed).await;
        let outcome = updater.set_status("FAILED", id).await.unwrap();
        assert_eq!(
            outcome,
            StatusUpdate::Conflict {
                current: ImageStatus::Completed
            }
        );
        assert_eq!(store.status_of(id).await, Some(ImageStatus::Completed));
    }

    #[tokio::test]
    async fn repeated_non_terminal_status_is_unchanged() {
        let (_, updater, id) = setup(ImageStatus::Processing).await;
        let outcome = updater.apply(ImageStatus::Processing, id).await.unwrap();
        assert_eq!(outcome, StatusUpdate::Unchanged);
    }
}
