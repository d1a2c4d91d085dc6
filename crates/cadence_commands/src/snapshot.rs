//! Serializable views of scheduler state for telemetry.
//!
//! A [`SchedulerSnapshot`] is a point-in-time copy; holding one does not keep
//! any command alive or block the scheduler.

use serde::Serialize;

/// Point-in-time view of a scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    /// Duration of the most recent tick, in milliseconds.
    pub last_run_time_ms: f64,
    /// Commands waiting to be promoted on the next tick, in submission order.
    pub queued: Vec<CommandSnapshot>,
    /// Running commands, in promotion order.
    pub running: Vec<CommandSnapshot>,
}

/// One command in a [`SchedulerSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandSnapshot {
    /// Identifies this particular run of the command.
    pub run_id: u64,
    /// Run ID of the command that forked this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<u64>,
    /// The command's name.
    pub name: String,
    /// The command's priority.
    pub priority: i32,
    /// Names of directly required mechanisms.
    pub requirements: Vec<String>,
    /// Time spent in the most recent resumption, in milliseconds.
    pub last_time_ms: f64,
    /// Time spent across every resumption of this run, in milliseconds.
    pub total_time_ms: f64,
}
