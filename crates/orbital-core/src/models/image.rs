use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PipelineError;

/// Processing status of an image record.
///
/// Persisted as the exact literals `PENDING`, `PROCESSING`, `COMPLETED`,
/// `FAILED`. `COMPLETED` and `FAILED` are terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    pub const ALL: [ImageStatus; 4] = [
        ImageStatus::Pending,
        ImageStatus::Processing,
        ImageStatus::Completed,
        ImageStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "PENDING",
            ImageStatus::Processing => "PROCESSING",
            ImageStatus::Completed => "COMPLETED",
            ImageStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Completed | ImageStatus::Failed)
    }
}

impl Display for ImageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ImageStatus::Pending),
            "PROCESSING" => Ok(ImageStatus::Processing),
            "COMPLETED" => Ok(ImageStatus::Completed),
            "FAILED" => Ok(ImageStatus::Failed),
            other => Err(PipelineError::InvalidStatus(other.to_string())),
        }
    }
}

/// Image record owned by the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub title: String,
    pub owner_id: Uuid,
    pub status: ImageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A freshly uploaded record. PENDING is the only valid initial status.
    pub fn new(title: impl Into<String>, owner_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            owner_id,
            status: ImageStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for ImageRecord {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(ImageRecord {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            owner_id: row.try_get("owner_id")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse status: {}", e).into())
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_literals() {
        assert_eq!(ImageStatus::Pending.to_string(), "PENDING");
        assert_eq!(ImageStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(ImageStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(ImageStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_status_from_str() {
        for status in ImageStatus::ALL {
            assert_eq!(status.as_str().parse::<ImageStatus>().unwrap(), status);
        }
        assert!(matches!(
            "completed".parse::<ImageStatus>(),
            Err(PipelineError::InvalidStatus(_))
        ));
        assert!("DONE".parse::<ImageStatus>().is_err());
    }

    #[test]
    fn test_terminal() {
        assert!(!ImageStatus::Pending.is_terminal());
        assert!(!ImageStatus::Processing.is_terminal());
        assert!(ImageStatus::Completed.is_terminal());
        assert!(ImageStatus::Failed.is_terminal());
    }

    #[test]
    fn test_serde_uses_persisted_literals() {
        let json = serde_json::to_string(&ImageStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        let parsed: ImageStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, ImageStatus::Failed);
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = ImageRecord::new("pic.jpg", Uuid::new_v4());
        assert_eq!(record.status, ImageStatus::Pending);
        assert_eq!(record.title, "pic.jpg");
    }
}
