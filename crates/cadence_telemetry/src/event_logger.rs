//! Forwards scheduler events to `tracing`.
//!
//! # Example
//!
//! ```
//! use cadence_commands::prelude::*;
//! use cadence_telemetry::EventLogger;
//!
//! let scheduler = Scheduler::new();
//! EventLogger::new().attach(&scheduler);
//! ```

use cadence_commands::event::SchedulerEvent;
use cadence_commands::scheduler::Scheduler;

/// Scheduler event listener that emits one `tracing` event per
/// [`SchedulerEvent`].
///
/// Failures log at `WARN`, interruptions at `INFO`, other lifecycle changes at
/// `DEBUG`, and per-tick resumptions at `TRACE`. Every event carries the
/// command name and priority as structured fields.
#[derive(Debug, Clone, Copy)]
pub struct EventLogger {
    resumptions: bool,
}

impl Default for EventLogger {
    fn default() -> Self {
        Self { resumptions: true }
    }
}

impl EventLogger {
    /// Creates a logger that records every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Controls whether `Mounted` and `Yielded` events are logged.
    ///
    /// These fire for every running command on every tick.
    #[must_use]
    pub fn with_resumptions(mut self, enabled: bool) -> Self {
        self.resumptions = enabled;
        self
    }

    /// Registers this logger with a scheduler.
    pub fn attach(self, scheduler: &Scheduler) {
        scheduler.add_event_listener(move |event| self.log(event));
    }

    /// Emits the `tracing` event for one scheduler event.
    pub fn log(&self, event: &SchedulerEvent) {
        let command = event.command();
        let name = command.name();
        let priority = command.priority();

        match event {
            SchedulerEvent::Scheduled { .. } => {
                tracing::debug!(command = name, priority, "Command scheduled");
            }
            SchedulerEvent::Mounted { .. } if self.resumptions => {
                tracing::trace!(command = name, "Command mounted");
            }
            SchedulerEvent::Yielded { .. } if self.resumptions => {
                tracing::trace!(command = name, "Command yielded");
            }
            SchedulerEvent::Mounted { .. } | SchedulerEvent::Yielded { .. } => {}
            SchedulerEvent::Completed { .. } => {
                tracing::debug!(command = name, priority, "Command completed");
            }
            SchedulerEvent::CompletedWithError { error, .. } => {
                tracing::warn!(command = name, priority, error = %error, "Command failed");
            }
            SchedulerEvent::Canceled { .. } => {
                tracing::debug!(command = name, priority, "Command canceled");
            }
            SchedulerEvent::Interrupted { interrupter, .. } => {
                tracing::info!(
                    command = name,
                    priority,
                    interrupter = interrupter.name(),
                    interrupter_priority = interrupter.priority(),
                    "Command interrupted"
                );
            }
        }
    }
}
