//! Configuration module
//!
//! Worker and CLI settings are read from the process environment (after
//! loading `.env`), one variable per field, e.g. `TASK_QUEUE_MAX_WORKERS`.

use serde::Deserialize;

const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const TASK_QUEUE_MAX_WORKERS: usize = 4;
const TASK_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
const TASK_QUEUE_DEFAULT_TIMEOUT_SECS: i32 = 300;
const TASK_QUEUE_MAX_RETRIES: i32 = 3;
const STALE_TASK_REAP_INTERVAL_SECS: u64 = 60;
const STALE_TASK_GRACE_PERIOD_SECS: i64 = 300;
const NOTIFY_RATE_LIMIT: f64 = 10.0;
const SMTP_PORT: u16 = 587;

fn default_max_connections() -> u32 {
    MAX_CONNECTIONS
}
fn default_timeout_seconds() -> u64 {
    CONNECTION_TIMEOUT_SECS
}
fn default_true() -> bool {
    true
}
fn default_smtp_port() -> u16 {
    SMTP_PORT
}
fn default_max_workers() -> usize {
    TASK_QUEUE_MAX_WORKERS
}
fn default_poll_interval_ms() -> u64 {
    TASK_QUEUE_POLL_INTERVAL_MS
}
fn default_task_timeout() -> i32 {
    TASK_QUEUE_DEFAULT_TIMEOUT_SECS
}
fn default_max_retries() -> i32 {
    TASK_QUEUE_MAX_RETRIES
}
fn default_reap_interval() -> u64 {
    STALE_TASK_REAP_INTERVAL_SECS
}
fn default_grace_period() -> i64 {
    STALE_TASK_GRACE_PERIOD_SECS
}
fn default_notify_rate_limit() -> f64 {
    NOTIFY_RATE_LIMIT
}
fn default_environment() -> String {
    "development".to_string()
}

/// Application configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_timeout_seconds")]
    pub db_timeout_seconds: u64,

    // Email notifications
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    #[serde(default = "default_true")]
    pub smtp_tls: bool,

    /// Delete the uploaded file once its metadata has been extracted.
    #[serde(default = "default_true")]
    pub remove_after_processing: bool,

    // Task queue
    #[serde(default = "default_max_workers")]
    pub task_queue_max_workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub task_queue_poll_interval_ms: u64,
    #[serde(default = "default_task_timeout")]
    pub task_queue_default_timeout_seconds: i32,
    #[serde(default = "default_max_retries")]
    pub task_queue_max_retries: i32,
    /// Interval in seconds between runs of the stale task reaper. 0 = disabled.
    #[serde(default = "default_reap_interval")]
    pub task_queue_stale_task_reap_interval_secs: u64,
    /// Grace period in seconds added to task timeout before reaping stale running tasks.
    #[serde(default = "default_grace_period")]
    pub task_queue_stale_task_grace_period_secs: i64,
    /// Notification tasks started per second.
    #[serde(default = "default_notify_rate_limit")]
    pub task_queue_notify_rate_limit: f64,

    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        let config: Config = envy::from_env()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from explicit key/value pairs instead of the process environment.
    pub fn from_iter<I>(vars: I) -> Result<Self, anyhow::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config =
            envy::from_iter(vars).map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    /// Whether an SMTP relay is configured. Without one, notifications are
    /// only logged.
    pub fn smtp_enabled(&self) -> bool {
        self.smtp_host.is_some()
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        if self.task_queue_max_workers == 0 {
            return Err(anyhow::anyhow!("TASK_QUEUE_MAX_WORKERS must be at least 1"));
        }

        if self.task_queue_max_retries < 0 {
            return Err(anyhow::anyhow!("TASK_QUEUE_MAX_RETRIES cannot be negative"));
        }

        if self.task_queue_notify_rate_limit <= 0.0 {
            return Err(anyhow::anyhow!(
                "TASK_QUEUE_NOTIFY_RATE_LIMIT must be greater than zero"
            ));
        }

        if self.is_production() && !self.smtp_enabled() {
            return Err(anyhow::anyhow!("SMTP_HOST must be set in production"));
        }

        Ok(())
    }
}
