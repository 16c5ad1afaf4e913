//! Logging initialisation for the controller manager.
//!
//! Two modes:
//! - Console output with local timestamps for interactive use.
//! - JSON output for production environments with log aggregation
//!   (ELK, Loki, Datadog).

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging with console output.
///
/// The filter honours `RUST_LOG` when set, falling back to `level`.
///
/// # Example
/// ```
/// virtrigaud_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();

    Ok(())
}

/// Initialize logging with JSON output format.
///
/// Outputs structured JSON logs suitable for log aggregation pipelines.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true),
        )
        .init();

    Ok(())
}

/// A helper struct that logs operation duration when finished.
pub struct TimedOperation {
    operation: String,
    start: std::time::Instant,
}

impl TimedOperation {
    pub fn new(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!(operation = %operation, "Starting timed operation");
        Self {
            operation,
            start: std::time::Instant::now(),
        }
    }

    pub fn success(self) {
        tracing::info!(
            operation = %self.operation,
            duration_ms = %self.start.elapsed().as_millis(),
            "Operation completed"
        );
        std::mem::forget(self);
    }

    pub fn failure(self, error: &str) {
        tracing::error!(
            operation = %self.operation,
            duration_ms = %self.start.elapsed().as_millis(),
            error = error,
            "Operation failed"
        );
        std::mem::forget(self);
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        tracing::warn!(
            operation = %self.operation,
            duration_ms = %self.start.elapsed().as_millis(),
            "Operation ended without explicit success/failure"
        );
    }
}
