//! Error types for command bodies and the scheduler.

use crate::command::Command;

/// Boxed error type accepted from command bodies.
pub type BoxError = Box<dyn core::error::Error + Send + Sync + 'static>;

/// Failure raised by a command body.
///
/// Command bodies return `Result<(), CommandError>`; returning `Err` ends the
/// command immediately and releases everything it held.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The body reported a failure with a message.
    #[error("{0}")]
    Failed(String),

    /// The body propagated an arbitrary error.
    #[error(transparent)]
    Other(#[from] BoxError),

    /// The body panicked while being resumed.
    #[error("command panicked: {0}")]
    Panicked(String),

    /// A child command awaited by this body failed.
    #[error("child command `{name}` failed: {source}")]
    Child {
        /// Name of the failed child.
        name: String,
        /// What the child failed with.
        #[source]
        source: Box<CommandError>,
    },

    /// Commands that were required to run in parallel share a mechanism.
    #[error(
        "Commands running in parallel cannot share requirements: \
         {first} and {second} both require {mechanism}"
    )]
    ConflictingRequirements {
        /// Name of the first conflicting command.
        first: String,
        /// Name of the second conflicting command.
        second: String,
        /// Name of a mechanism both commands require.
        mechanism: String,
    },
}

impl CommandError {
    /// Creates a [`CommandError::Failed`] from any message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wraps an arbitrary error as [`CommandError::Other`].
    #[must_use]
    pub fn other(error: impl Into<BoxError>) -> Self {
        Self::Other(error.into())
    }

    /// Builds a [`CommandError::Panicked`] from a caught panic payload.
    pub(crate) fn from_panic(payload: &(dyn core::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self::Panicked(message)
    }
}

/// A command body failed while the scheduler was resuming it.
///
/// Returned from [`Scheduler::run`](crate::scheduler::Scheduler::run). By the
/// time this error is observed, the failing command has already been removed
/// from the scheduler along with every child it started, and its mechanisms are
/// free again.
#[derive(Debug, thiserror::Error)]
#[error("command `{}` failed: {}", .command.name(), .source)]
pub struct ExecutionError {
    command: Command,
    #[source]
    source: CommandError,
}

impl ExecutionError {
    pub(crate) fn new(command: Command, source: CommandError) -> Self {
        Self { command, source }
    }

    /// Returns the command whose body failed.
    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Returns the error the body raised.
    #[must_use]
    pub fn error(&self) -> &CommandError {
        &self.source
    }

    /// Consumes the wrapper and returns the body's error.
    #[must_use]
    pub fn into_error(self) -> CommandError {
        self.source
    }
}

/// Invalid assignment of a mechanism's default command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefaultCommandError {
    /// The command does not require the mechanism.
    #[error("default command `{command}` does not require {mechanism}")]
    MissingRequirement {
        /// Mechanism the default was assigned to.
        mechanism: String,
        /// Name of the rejected command.
        command: String,
    },

    /// The command requires mechanisms besides the one it defaults for.
    #[error("default command `{command}` for {mechanism} may not require other mechanisms")]
    ExtraRequirements {
        /// Mechanism the default was assigned to.
        mechanism: String,
        /// Name of the rejected command.
        command: String,
    },

    /// The mechanism was created for a different scheduler.
    #[error("mechanism {0} is not managed by this scheduler")]
    ForeignMechanism(String),

    /// The scheduler that owns the mechanism no longer exists.
    #[error("the scheduler owning {0} has been dropped")]
    SchedulerDropped(String),
}

/// Invalid wiring of a [`StateMachine`](crate::state_machine::StateMachine).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// A state was used with a machine it was not added to.
    #[error("state `{state}` does not belong to state machine `{machine}`")]
    ForeignState {
        /// Name of the machine being configured.
        machine: String,
        /// Name of the offending state's command.
        state: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_requirements_message() {
        let error = CommandError::ConflictingRequirements {
            first: "Left".into(),
            second: "Right".into(),
            mechanism: "Drive".into(),
        };
        assert_eq!(
            error.to_string(),
            "Commands running in parallel cannot share requirements: \
             Left and Right both require Drive"
        );
    }

    #[test]
    fn child_error_exposes_source() {
        use core::error::Error as _;

        let error = CommandError::Child {
            name: "Grab".into(),
            source: Box::new(CommandError::failed("jammed")),
        };
        assert_eq!(error.to_string(), "child command `Grab` failed: jammed");
        assert_eq!(error.source().map(ToString::to_string).as_deref(), Some("jammed"));
    }

    #[test]
    fn other_wraps_foreign_errors_transparently() {
        let io = std::io::Error::other("sensor offline");
        let error = CommandError::other(io);
        assert_eq!(error.to_string(), "sensor offline");
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let static_str: Box<dyn core::any::Any + Send> = Box::new("boom");
        let owned: Box<dyn core::any::Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn core::any::Any + Send> = Box::new(42_u8);

        assert!(matches!(CommandError::from_panic(&*static_str), CommandError::Panicked(m) if m == "boom"));
        assert!(matches!(CommandError::from_panic(&*owned), CommandError::Panicked(m) if m == "bang"));
        assert!(matches!(
            CommandError::from_panic(&*other),
            CommandError::Panicked(m) if m == "non-string panic payload"
        ));
    }
}
