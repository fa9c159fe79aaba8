//! Values flowing through one pipeline run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use super::image::ImageStatus;
use crate::constants::RESERVED_METADATA_KEYS;

/// Input of one pipeline run, built once per upload event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInput {
    pub record_id: Uuid,
    pub resource_path: PathBuf,
    pub display_name: String,
    pub recipient: String,
}

impl PipelineInput {
    pub fn new(
        record_id: Uuid,
        resource_path: impl Into<PathBuf>,
        display_name: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            record_id,
            resource_path: resource_path.into(),
            display_name: display_name.into(),
            recipient: recipient.into(),
        }
    }
}

/// Flat metadata extracted from an image.
///
/// Serializes as a single JSON object: `width`, `height`, `format` plus one
/// string entry per tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    #[serde(flatten)]
    pub tags: BTreeMap<String, String>,
}

impl ImageMetadata {
    pub fn new(width: u32, height: u32, format: impl Into<String>) -> Self {
        Self {
            width,
            height,
            format: format.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag unless its key collides with a reserved document field.
    /// Returns false when the tag was dropped.
    pub fn insert_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if RESERVED_METADATA_KEYS.contains(&key.as_str()) {
            return false;
        }
        self.tags.insert(key, value.into());
        true
    }
}

/// One document in the metadata collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub record_id: String,
    #[serde(flatten)]
    pub metadata: ImageMetadata,
}

impl MetadataDocument {
    pub fn new(record_id: Uuid, metadata: ImageMetadata) -> Self {
        Self {
            record_id: record_id.to_string(),
            metadata,
        }
    }
}

/// Which message the notifier renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationOutcome {
    Success,
    Failure,
}

impl NotificationOutcome {
    /// COMPLETED notifies success; every other status notifies failure.
    pub fn from_status(status: ImageStatus) -> Self {
        match status {
            ImageStatus::Completed => NotificationOutcome::Success,
            _ => NotificationOutcome::Failure,
        }
    }

    pub fn mood(&self) -> &'static str {
        match self {
            NotificationOutcome::Success => "happy",
            NotificationOutcome::Failure => "troubled",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NotificationOutcome::Success => "successfully",
            NotificationOutcome::Failure => "unsuccessfully",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_serializes_flat() {
        let mut metadata = ImageMetadata::new(584, 560, "JPEG");
        metadata.insert_tag("Make", "samsung");
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            value,
            json!({"width": 584, "height": 560, "format": "JPEG", "Make": "samsung"})
        );
    }

    #[test]
    fn reserved_tag_keys_are_dropped() {
        let mut metadata = ImageMetadata::new(1, 1, "PNG");
        assert!(!metadata.insert_tag("width", "9000"));
        assert!(!metadata.insert_tag("record_id", "x"));
        assert!(metadata.tags.is_empty());
        assert_eq!(metadata.width, 1);
    }

    #[test]
    fn document_carries_record_id_by_value() {
        let id = Uuid::new_v4();
        let doc = MetadataDocument::new(id, ImageMetadata::new(720, 636, "PNG"));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            value,
            json!({"record_id": id.to_string(), "width": 720, "height": 636, "format": "PNG"})
        );

        let parsed: MetadataDocument = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn document_with_tags_parses_back() {
        let value = json!({
            "record_id": "abc",
            "width": 10,
            "height": 20,
            "format": "JPEG",
            "Model": "SM-G930F",
            "Orientation": "1"
        });
        let doc: MetadataDocument = serde_json::from_value(value).unwrap();
        assert_eq!(doc.record_id, "abc");
        assert_eq!(doc.metadata.tags.get("Model").map(String::as_str), Some("SM-G930F"));
        assert_eq!(doc.metadata.tags.len(), 2);
    }

    #[test]
    fn outcome_from_status() {
        assert_eq!(
            NotificationOutcome::from_status(ImageStatus::Completed),
            NotificationOutcome::Success
        );
        assert_eq!(
            NotificationOutcome::from_status(ImageStatus::Failed),
            NotificationOutcome::Failure
        );
        assert_eq!(NotificationOutcome::Success.mood(), "happy");
        assert_eq!(NotificationOutcome::Failure.label(), "unsuccessfully");
    }
}
