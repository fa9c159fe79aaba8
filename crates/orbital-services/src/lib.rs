//! Orbital Services Layer
//!
//! The side-effecting pipeline stages: the document writer, the notifier with
//! its mail transports, and the guarded status updater. Each stage reports
//! failures as [`PipelineError`] so the worker can classify them.

pub mod document_writer;
pub mod email;
pub mod notifier;
pub mod status_updater;

pub use document_writer::DocumentWriter;
pub use email::{sender_address, MailTransport, OutboxMailer, OutgoingEmail, SmtpMailer};
pub use notifier::{Notification, Notifier};
pub use status_updater::{StatusUpdate, StatusUpdater};

use orbital_core::PipelineError;

/// Collapse a store failure into [`PipelineError::Store`], keeping the
/// original message when the store already classified it.
pub(crate) fn store_error(err: anyhow::Error) -> PipelineError {
    match err.downcast::<PipelineError>() {
        Ok(e @ PipelineError::Store(_)) => e,
        Ok(other) => PipelineError::Store(other.to_string()),
        Err(err) => PipelineError::Store(format!("{:#}", err)),
    }
}
