//! Logging and telemetry for the Cadence command scheduler.
//!
//! - [`TracingSetup`] - Installs the process-wide `tracing` subscriber
//! - [`EventLogger`] - Logs every scheduler lifecycle event
//! - [`SnapshotPublisher`] - Publishes scheduler state as JSON

/// Scheduler event logging.
pub mod event_logger;

/// JSON snapshot publishing.
pub mod snapshot;

/// Tracing subscriber configuration.
pub mod tracing_setup;

pub use event_logger::EventLogger;
pub use snapshot::{SnapshotPublisher, snapshot_json};
pub use tracing_setup::{TracingConfig, TracingFormat, TracingSetup};

/// Errors produced while publishing telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A snapshot could not be serialized.
    #[error("failed to serialize scheduler snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::TelemetryError;
    pub use crate::event_logger::EventLogger;
    pub use crate::snapshot::{SnapshotPublisher, snapshot_json};
    pub use crate::tracing_setup::{TracingConfig, TracingFormat, TracingSetup};
}
