//! Mail transports for status notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::Mutex;

use orbital_core::constants::DEFAULT_SENDER;
use orbital_core::{Config, PipelineError};

/// A rendered plain-text email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Sends one rendered email. Implementations do not retry.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), PipelineError>;
}

/// SMTP transport built from the `SMTP_*` settings.
#[derive(Clone)]
pub struct SmtpMailer {
    mailer: Arc<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpMailer {
    /// Create the transport from config. Returns `Ok(None)` when no SMTP host
    /// is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, PipelineError> {
        let Some(host) = config.smtp_host.as_deref() else {
            tracing::debug!("SMTP_HOST not set, SMTP transport disabled");
            return Ok(None);
        };
        let port = config.smtp_port;
        let credentials = match (&config.smtp_user, &config.smtp_password) {
            (Some(u), Some(p)) => Some(Credentials::new(u.clone(), p.clone())),
            _ => None,
        };

        let builder = if config.smtp_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| PipelineError::Config(format!("Invalid SMTP relay {}: {}", host, e)))?
                .port(port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(port)
        };
        let builder = match credentials {
            Some(c) => builder.credentials(c),
            None => builder,
        };

        tracing::info!(
            host = %host,
            port = port,
            tls = config.smtp_tls,
            "Email transport initialized (SMTP)"
        );
        Ok(Some(Self {
            mailer: Arc::new(builder.build()),
        }))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), PipelineError> {
        let to: Mailbox = email.to.parse().map_err(|e| {
            PipelineError::InvalidAddress(format!("recipient {}: {}", email.to, e))
        })?;
        let from: Mailbox = email.from.parse().map_err(|e| {
            PipelineError::InvalidAddress(format!("SMTP_FROM {}: {}", email.from, e))
        })?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(email.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
            .map_err(|e| PipelineError::Notification(e.to_string()))?;

        self.mailer
            .send(message)
            .await
            .map_err(|e| PipelineError::Notification(e.to_string()))?;
        Ok(())
    }
}

/// Keeps sent emails in memory and logs them.
///
/// Used when no SMTP relay is configured and by tests, which can also make it
/// reject sends to exercise the failure path.
#[derive(Clone, Default)]
pub struct OutboxMailer {
    outbox: Arc<Mutex<Vec<OutgoingEmail>>>,
    rejecting: Arc<AtomicBool>,
}

impl OutboxMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.outbox.lock().await.clone()
    }

    pub async fn sent_to(&self, recipient: &str) -> Vec<OutgoingEmail> {
        self.outbox
            .lock()
            .await
            .iter()
            .filter(|e| e.to == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MailTransport for OutboxMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), PipelineError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(PipelineError::Notification(
                "outbox transport rejected the message".to_string(),
            ));
        }
        tracing::info!(to = %email.to, subject = %email.subject, "Email queued in outbox");
        self.outbox.lock().await.push(email.clone());
        Ok(())
    }
}

/// Sender address from config, falling back to the default sender.
pub fn sender_address(config: &Config) -> String {
    config
        .smtp_from
        .clone()
        .unwrap_or_else(|| DEFAULT_SENDER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let mut all = vec![(
            "DATABASE_URL".to_string(),
            "postgresql://localhost/orbital".to_string(),
        )];
        all.extend(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        Config::from_iter(all).unwrap()
    }

    fn email(to: &str) -> OutgoingEmail {
        OutgoingEmail {
            from: DEFAULT_SENDER.to_string(),
            to: to.to_string(),
            subject: "Task Completed".to_string(),
            body: "body".to_string(),
        }
    }

    #[test]
    fn smtp_disabled_without_host() {
        let config = config(&[]);
        assert!(SmtpMailer::from_config(&config).unwrap().is_none());
        assert_eq!(sender_address(&config), DEFAULT_SENDER);
    }

    #[tokio::test]
    async fn smtp_enabled_with_host() {
        let config = config(&[
            ("SMTP_HOST", "localhost"),
            ("SMTP_TLS", "false"),
            ("SMTP_PORT", "2525"),
            ("SMTP_FROM", "pipeline@example.com"),
        ]);
        assert!(SmtpMailer::from_config(&config).unwrap().is_some());
        assert_eq!(sender_address(&config), "pipeline@example.com");
    }

    #[tokio::test]
    async fn smtp_rejects_invalid_recipient() {
        let config = config(&[("SMTP_HOST", "localhost"), ("SMTP_TLS", "false")]);
        let mailer = SmtpMailer::from_config(&config).unwrap().unwrap();
        let err = mailer.send(&email("not an address")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidAddress(_)));
        assert!(!err.is_recoverable());
        assert!(err.is_compensable());
    }

    #[tokio::test]
    async fn smtp_rejects_invalid_sender_without_retry() {
        let config = config(&[("SMTP_HOST", "localhost"), ("SMTP_TLS", "false")]);
        let mailer = SmtpMailer::from_config(&config).unwrap().unwrap();
        let mut message = email("owner@example.com");
        message.from = "noreply at example".to_string();
        let err = mailer.send(&message).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidAddress(_)));
        assert_eq!(err.error_code(), "INVALID_ADDRESS");
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn outbox_records_and_rejects() {
        let outbox = OutboxMailer::new();
        outbox.send(&email("a@example.com")).await.unwrap();
        outbox.send(&email("b@example.com")).await.unwrap();
        assert_eq!(outbox.sent().await.len(), 2);
        assert_eq!(outbox.sent_to("a@example.com").await.len(), 1);

        outbox.set_rejecting(true);
        let err = outbox.send(&email("a@example.com")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Notification(_)));
        assert_eq!(outbox.sent().await.len(), 2);
    }
}
