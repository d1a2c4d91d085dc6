//! Scheduler lifecycle events.
//!
//! Listeners registered with
//! [`Scheduler::add_event_listener`](crate::scheduler::Scheduler::add_event_listener)
//! receive `&SchedulerEvent` and can match on variants for typed access.
//! Events are delivered after the scheduler's bookkeeping has been updated,
//! with no internal lock held, so a listener may query the scheduler.
//!
//! # Example
//!
//! ```
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! scheduler.add_event_listener(|event| match event {
//!     SchedulerEvent::Interrupted { command, interrupter, .. } => {
//!         println!("{command} interrupted by {interrupter}");
//!     }
//!     SchedulerEvent::CompletedWithError { command, error, .. } => {
//!         println!("{command} failed: {error}");
//!     }
//!     _ => {}
//! });
//! ```

use std::sync::Arc;
use std::time::Instant;

use crate::command::Command;

/// Callback invoked for every [`SchedulerEvent`].
pub type EventListener = Arc<dyn Fn(&SchedulerEvent) + Send + Sync>;

/// Unified event enum for every command lifecycle transition.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────
    /// A command was accepted by `schedule` or started as a child or default.
    Scheduled {
        /// The scheduled command.
        command: Command,
        /// When it happened, per the scheduler clock.
        at: Instant,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────
    /// A command is about to be resumed.
    Mounted {
        /// The resumed command.
        command: Command,
        /// When it happened, per the scheduler clock.
        at: Instant,
    },

    /// A command suspended and will be resumed on a later tick.
    Yielded {
        /// The suspended command.
        command: Command,
        /// When it happened, per the scheduler clock.
        at: Instant,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Termination
    // ─────────────────────────────────────────────────────────────────────────
    /// A command's body returned successfully.
    Completed {
        /// The completed command.
        command: Command,
        /// When it happened, per the scheduler clock.
        at: Instant,
    },

    /// A command's body failed.
    CompletedWithError {
        /// The failed command.
        command: Command,
        /// Rendered error message.
        error: String,
        /// When it happened, per the scheduler clock.
        at: Instant,
    },

    /// A command was canceled, directly or because its parent ended.
    Canceled {
        /// The canceled command.
        command: Command,
        /// When it happened, per the scheduler clock.
        at: Instant,
    },

    /// A command lost its mechanisms to a conflicting request.
    ///
    /// Always followed by a [`Canceled`](Self::Canceled) event for the same
    /// command.
    Interrupted {
        /// The interrupted command.
        command: Command,
        /// The command that took over.
        interrupter: Command,
        /// When it happened, per the scheduler clock.
        at: Instant,
    },
}

impl SchedulerEvent {
    /// Returns the command the event is about.
    #[must_use]
    pub fn command(&self) -> &Command {
        match self {
            Self::Scheduled { command, .. }
            | Self::Mounted { command, .. }
            | Self::Yielded { command, .. }
            | Self::Completed { command, .. }
            | Self::CompletedWithError { command, .. }
            | Self::Canceled { command, .. }
            | Self::Interrupted { command, .. } => command,
        }
    }

    /// Returns when the event happened.
    #[must_use]
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Scheduled { at, .. }
            | Self::Mounted { at, .. }
            | Self::Yielded { at, .. }
            | Self::Completed { at, .. }
            | Self::CompletedWithError { at, .. }
            | Self::Canceled { at, .. }
            | Self::Interrupted { at, .. } => *at,
        }
    }

    /// Returns a short, stable name for the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scheduled { .. } => "scheduled",
            Self::Mounted { .. } => "mounted",
            Self::Yielded { .. } => "yielded",
            Self::Completed { .. } => "completed",
            Self::CompletedWithError { .. } => "completed_with_error",
            Self::Canceled { .. } => "canceled",
            Self::Interrupted { .. } => "interrupted",
        }
    }
}
