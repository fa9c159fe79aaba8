use std::sync::Arc;

use orbital_db::{DocumentStore, ImageRecordStore};
use orbital_processing::MetadataExtractor;
use orbital_services::{DocumentWriter, MailTransport, Notifier, StatusUpdater};

/// Everything the stage handlers need. Shared by every worker task.
#[derive(Clone)]
pub struct PipelineState {
    pub records: Arc<dyn ImageRecordStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub extractor: MetadataExtractor,
    pub document_writer: DocumentWriter,
    pub notifier: Notifier,
    pub status_updater: StatusUpdater,
}

impl PipelineState {
    pub fn new(
        records: Arc<dyn ImageRecordStore>,
        documents: Arc<dyn DocumentStore>,
        mailer: Arc<dyn MailTransport>,
        sender: impl Into<String>,
        remove_after_processing: bool,
    ) -> Self {
        Self {
            extractor: MetadataExtractor::new(remove_after_processing),
            document_writer: DocumentWriter::new(documents.clone()),
            notifier: Notifier::new(mailer, sender),
            status_updater: StatusUpdater::new(records.clone()),
            records,
            documents,
        }
    }
}
