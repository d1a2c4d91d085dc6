//! JSON publishing of scheduler snapshots.
//!
//! A dashboard usually wants the scheduler state a few times per second, not
//! every control-loop tick. [`SnapshotPublisher`] renders
//! [`SchedulerSnapshot`]s as JSON on a fixed tick interval and hands them to a
//! sink (a network table, a file, a channel).
//!
//! # Example
//!
//! ```
//! use std::sync::mpsc;
//! use cadence_commands::prelude::*;
//! use cadence_telemetry::SnapshotPublisher;
//!
//! let scheduler = Scheduler::new();
//! let (tx, rx) = mpsc::channel();
//! SnapshotPublisher::new()
//!     .with_interval(5)
//!     .attach(&scheduler, move |json| {
//!         let _ = tx.send(json);
//!     });
//!
//! for _ in 0..10 {
//!     scheduler.run()?;
//! }
//! assert_eq!(rx.try_iter().count(), 2);
//! # Ok::<(), ExecutionError>(())
//! ```

use cadence_commands::CommandError;
use cadence_commands::scheduler::Scheduler;
use cadence_commands::snapshot::SchedulerSnapshot;

use crate::TelemetryError;

/// Renders the scheduler's current state as JSON.
///
/// # Errors
///
/// Returns [`TelemetryError::Serialize`] if serialization fails.
pub fn snapshot_json(scheduler: &Scheduler) -> Result<String, TelemetryError> {
    Ok(serde_json::to_string(&scheduler.snapshot())?)
}

/// Periodically publishes scheduler snapshots as JSON.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPublisher {
    interval: u32,
    pretty: bool,
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self {
            interval: 1,
            pretty: false,
        }
    }
}

impl SnapshotPublisher {
    /// Creates a publisher that emits on every tick.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits once every `ticks` ticks. Zero is treated as one.
    #[must_use]
    pub fn with_interval(mut self, ticks: u32) -> Self {
        self.interval = ticks.max(1);
        self
    }

    /// Enables indented output.
    #[must_use]
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Renders one snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Serialize`] if serialization fails.
    pub fn render(&self, snapshot: &SchedulerSnapshot) -> Result<String, TelemetryError> {
        let json = if self.pretty {
            serde_json::to_string_pretty(snapshot)?
        } else {
            serde_json::to_string(snapshot)?
        };
        Ok(json)
    }

    /// Publishes to `sink` from a sideload on the scheduler.
    ///
    /// Sideloads run at the start of a tick, so each snapshot reflects the
    /// state left by the previous tick. Serialization failures are logged and
    /// skipped.
    pub fn attach<F>(self, scheduler: &Scheduler, mut sink: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        scheduler.sideload(move |co| async move {
            let mut ticks: u32 = 0;
            loop {
                ticks += 1;
                if ticks >= self.interval {
                    ticks = 0;
                    let snapshot = co.scheduler().map(|scheduler| scheduler.snapshot());
                    match snapshot.map(|snapshot| self.render(&snapshot)) {
                        Some(Ok(json)) => sink(json),
                        Some(Err(error)) => {
                            tracing::warn!(error = %error, "Failed to publish scheduler snapshot");
                        }
                        None => {}
                    }
                }
                if !co.yield_now().await {
                    return Ok::<(), CommandError>(());
                }
            }
        });
    }
}
