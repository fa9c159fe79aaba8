//! Status email notifier.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use orbital_core::constants::{COMPLETED_AT_FORMAT, NOTIFICATION_SUBJECT};
use orbital_core::models::{ImageStatus, NotificationOutcome};
use orbital_core::PipelineError;

use crate::email::{MailTransport, OutgoingEmail};

/// One notification, built and consumed within a single notifier call.
#[derive(Debug, Clone)]
pub struct Notification {
    pub outcome: NotificationOutcome,
    pub recipient: String,
    pub display_name: String,
    pub completed_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        outcome: NotificationOutcome,
        recipient: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            outcome,
            recipient: recipient.into(),
            display_name: display_name.into(),
            completed_at: Utc::now(),
        }
    }

    pub fn render_body(&self) -> String {
        format!(
            "Hi {recipient},\n\n\
             We are {mood} to let you know that processing of your image \"{name}\" \
             finished {label}.\n\n\
             Completed at: {completed_at}\n",
            recipient = self.recipient,
            mood = self.outcome.mood(),
            name = self.display_name,
            label = self.outcome.label(),
            completed_at = self.completed_at.format(COMPLETED_AT_FORMAT),
        )
    }

    pub fn render(&self, from: &str) -> OutgoingEmail {
        OutgoingEmail {
            from: from.to_string(),
            to: self.recipient.clone(),
            subject: NOTIFICATION_SUBJECT.to_string(),
            body: self.render_body(),
        }
    }
}

/// Renders and sends exactly one email per call.
#[derive(Clone)]
pub struct Notifier {
    transport: Arc<dyn MailTransport>,
    sender: String,
}

impl Notifier {
    pub fn new(transport: Arc<dyn MailTransport>, sender: impl Into<String>) -> Self {
        Self {
            transport,
            sender: sender.into(),
        }
    }

    /// Send the email matching `status` and hand the status back for the next
    /// stage. A redelivered call sends a second email.
    #[tracing::instrument(skip(self), fields(status = %status))]
    pub async fn notify(
        &self,
        status: ImageStatus,
        recipient: &str,
        display_name: &str,
    ) -> Result<ImageStatus, PipelineError> {
        let notification = Notification::new(
            NotificationOutcome::from_status(status),
            recipient,
            display_name,
        );
        let email = notification.render(&self.sender);
        self.transport.send(&email).await?;

        tracing::info!(
            outcome = notification.outcome.label(),
            "Status notification sent"
        );
        Ok(status)
    }
}
