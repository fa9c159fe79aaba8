//! Orbital Infrastructure Library
//!
//! Shared infrastructure used by the worker and the CLI:
//! - Telemetry initialization (tracing subscriber)
//! - Rate limiting of stage execution

pub mod telemetry;

#[cfg(feature = "rate-limit")]
pub mod rate_limit;

pub use telemetry::{init_telemetry, LogFormat};

#[cfg(feature = "rate-limit")]
pub use rate_limit::RateLimiter;
