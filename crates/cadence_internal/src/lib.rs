//! # Cadence Internal Library
//!
//! Re-exports the core Cadence crates for convenience.

/// Mechanisms, commands and the cooperative scheduler.
pub use cadence_commands;

/// Tracing setup, event logging and snapshot publishing.
pub use cadence_telemetry;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use cadence_commands::prelude::*;
    pub use cadence_telemetry::prelude::*;
}
