//! Cooperative command scheduling for fixed-period control loops.
//!
//! `cadence_commands` runs many concurrent behaviors ("commands") on a single
//! thread inside a periodic loop, such as a robot controller's 20 ms cycle.
//! Commands declare the [`Mechanism`]s they need; the [`Scheduler`]
//! guarantees that at most one running command holds any mechanism and
//! resolves contention by priority.
//!
//! # Core Concepts
//!
//! - [`Mechanism`] - Exclusively-owned unit of contention, possibly nested
//! - [`Command`] - Immutable unit of work with a priority and requirements
//! - [`Coroutine`] - Handle a command body uses to suspend and compose
//! - [`Scheduler`] - Drives every command one step per tick
//! - [`SchedulerEvent`] - Lifecycle notifications for telemetry
//! - [`StateMachine`] - A command that moves through a graph of states
//! - [`Trigger`] - Schedules and cancels commands as a condition changes
//!
//! # Example
//!
//! ```
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let elevator = Mechanism::new("Elevator", &scheduler);
//! elevator.set_default_command(elevator.idle())?;
//!
//! let raise = elevator
//!     .run(|co| async move {
//!         co.yield_now().await;
//!         Ok(())
//!     })
//!     .with_priority(10)
//!     .named("Raise");
//!
//! scheduler.run()?;
//! assert_ne!(scheduler.holder_of(&elevator), None);
//!
//! scheduler.schedule(&raise);
//! scheduler.run()?;
//! assert_eq!(scheduler.holder_of(&elevator), Some(raise.clone()));
//!
//! scheduler.run()?;
//! assert!(!scheduler.is_running(&raise));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Commands and the builder used to define them.
pub mod command;

/// The suspension handle passed into command bodies.
pub mod coroutine;

/// Error types for command bodies and scheduler configuration.
pub mod error;

/// Scheduler lifecycle events.
pub mod event;

/// Mechanisms and nested mechanism footprints.
pub mod mechanism;

/// Ordered mechanism sets.
pub mod requirements;

/// The scheduler and its tick loop.
pub mod scheduler;

/// Serializable scheduler state.
pub mod snapshot;

/// State machines built from commands.
pub mod state_machine;

/// Clock abstraction for timestamps and waits.
pub mod time;

/// Condition-driven command bindings.
pub mod trigger;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::command::{
        Command, CommandBuilder, CommandId, CommandResult, InterruptBehavior,
    };
    pub use crate::coroutine::Coroutine;
    pub use crate::error::{
        CommandError, DefaultCommandError, ExecutionError, StateMachineError,
    };
    pub use crate::event::{EventListener, SchedulerEvent};
    pub use crate::mechanism::{Mechanism, MechanismId};
    pub use crate::requirements::Requirements;
    pub use crate::scheduler::{RunId, ScheduleResult, Scheduler, SchedulerBuilder};
    pub use crate::snapshot::{CommandSnapshot, SchedulerSnapshot};
    pub use crate::state_machine::StateMachine;
    pub use crate::time::{Clock, ClockProvider, Timer};
    pub use crate::trigger::{DebounceKind, Trigger};

    #[cfg(any(test, feature = "test-utils"))]
    pub use crate::time::MockClock;
}

// Re-export key types at crate root for convenience
pub use command::{Command, CommandResult};
pub use coroutine::Coroutine;
pub use error::{CommandError, ExecutionError};
pub use mechanism::Mechanism;
pub use scheduler::{ScheduleResult, Scheduler};
pub use state_machine::StateMachine;
pub use trigger::Trigger;
