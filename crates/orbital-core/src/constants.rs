//! Constants shared across the pipeline.

/// Subject line of every status email.
pub const NOTIFICATION_SUBJECT: &str = "Task Completed";

/// Sender address used when `SMTP_FROM` is not configured.
pub const DEFAULT_SENDER: &str = "noreply@example.com";

/// Timestamp layout used in notification bodies (`DD/MM/YYYY, HH:MM:SS`).
pub const COMPLETED_AT_FORMAT: &str = "%d/%m/%Y, %H:%M:%S";

/// Keys that the metadata document reserves for itself. Tags extracted from an
/// image never overwrite these.
pub const RESERVED_METADATA_KEYS: [&str; 4] = ["record_id", "width", "height", "format"];
