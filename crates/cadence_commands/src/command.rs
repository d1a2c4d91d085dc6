//! Commands: prioritized units of cooperative work.
//!
//! A [`Command`] is immutable data: a name, a priority, an interrupt
//! behavior, a set of required [`Mechanism`]s, and a body. The body is an
//! async closure that receives a [`Coroutine`] handle and is driven one step
//! per scheduler tick. All execution state lives in the
//! [`Scheduler`](crate::scheduler::Scheduler); every call to `schedule`
//! starts a fresh run of the body from the top.
//!
//! # Example
//!
//! ```
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let elevator = Mechanism::new("Elevator", &scheduler);
//!
//! let raise = Command::requiring([&elevator])
//!     .with_priority(10)
//!     .executing(|co| async move {
//!         for _ in 0..5 {
//!             if !co.yield_now().await {
//!                 break;
//!             }
//!         }
//!         Ok(())
//!     })
//!     .named("Raise Elevator");
//!
//! assert!(raise.requires(&elevator));
//! assert_eq!(raise.priority(), 10);
//! ```

use core::fmt;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::coroutine::Coroutine;
use crate::error::CommandError;
use crate::mechanism::Mechanism;
use crate::requirements::Requirements;

/// What a command body returns.
pub type CommandResult = Result<(), CommandError>;

/// Type-erased command body.
pub(crate) type Body = Arc<dyn Fn(Coroutine) -> BoxFuture<'static, CommandResult> + Send + Sync>;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(u64);

impl CommandId {
    fn next() -> Self {
        Self(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command_{}", self.0)
    }
}

/// How a command declares it should react when a conflicting request takes
/// its mechanisms.
///
/// The flag is recorded and exposed through [`Command::interrupt_behavior`]
/// only; the scheduler does not act on it.
/// Every interrupted command is discarded, whatever its behavior. If it is
/// scheduled again (or restarted as a default), it starts from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterruptBehavior {
    /// Tear the command down when interrupted.
    #[default]
    Cancel,
    /// Declares the command resumable. Recorded only; an interrupted
    /// command is torn down exactly like [`Cancel`](Self::Cancel).
    Suspend,
}

struct CommandInner {
    id: CommandId,
    name: String,
    priority: i32,
    interrupt_behavior: InterruptBehavior,
    requirements: Requirements,
    footprint: Requirements,
    body: Body,
}

/// A prioritized, mechanism-requiring unit of cooperative work.
///
/// `Command` is a cheap, clonable handle; clones share identity. Two commands
/// built separately are never equal, even if every field matches.
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

impl Command {
    /// The lowest possible priority. Used by idle commands.
    pub const LOWEST_PRIORITY: i32 = i32::MIN;

    /// Priority used when none is given.
    pub const DEFAULT_PRIORITY: i32 = 0;

    /// Starts building a command that requires the given mechanisms.
    #[must_use]
    pub fn requiring<'a>(mechanisms: impl IntoIterator<Item = &'a Mechanism>) -> CommandBuilder {
        CommandBuilder {
            requirements: mechanisms.into_iter().cloned().collect(),
            ..CommandBuilder::default()
        }
    }

    /// Starts building a command that requires nothing.
    ///
    /// Such commands never conflict and are useful for pure compositions.
    #[must_use]
    pub fn no_requirements() -> CommandBuilder {
        CommandBuilder::default()
    }

    /// Returns this command's identity.
    #[must_use]
    pub fn id(&self) -> CommandId {
        self.inner.id
    }

    /// Returns the diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the priority. Larger values win conflicts.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    /// Returns the interrupt behavior.
    #[must_use]
    pub fn interrupt_behavior(&self) -> InterruptBehavior {
        self.inner.interrupt_behavior
    }

    /// Returns the mechanisms this command directly requires.
    #[must_use]
    pub fn requirements(&self) -> &Requirements {
        &self.inner.requirements
    }

    /// Returns the requirements expanded through nested mechanisms.
    #[must_use]
    pub fn footprint(&self) -> &Requirements {
        &self.inner.footprint
    }

    /// Returns `true` if this command requires the mechanism, directly or
    /// through a composed mechanism.
    #[must_use]
    pub fn requires(&self, mechanism: &Mechanism) -> bool {
        self.inner.footprint.contains(mechanism)
    }

    /// Returns `true` if both commands contend for any mechanism.
    #[must_use]
    pub fn conflicts_with(&self, other: &Command) -> bool {
        let theirs = other.footprint();
        self.inner.footprint.iter().any(|m| theirs.contains(m))
    }

    /// Returns `true` if this command is strictly higher priority than `other`.
    #[must_use]
    pub fn is_higher_priority_than(&self, other: &Command) -> bool {
        self.inner.priority > other.inner.priority
    }

    /// Creates a fresh run of the body.
    pub(crate) fn start(&self, co: Coroutine) -> BoxFuture<'static, CommandResult> {
        (self.inner.body)(co)
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Command {}

impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("priority", &self.inner.priority)
            .field("requirements", &self.inner.requirements)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CommandBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Command`].
///
/// Finish with [`named`](Self::named); every command needs a name for
/// diagnostics. A builder without a body produces a command that completes
/// on its first resumption.
pub struct CommandBuilder {
    requirements: Requirements,
    priority: i32,
    interrupt_behavior: InterruptBehavior,
    body: Option<Body>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self {
            requirements: Requirements::new(),
            priority: Command::DEFAULT_PRIORITY,
            interrupt_behavior: InterruptBehavior::default(),
            body: None,
        }
    }
}

impl CommandBuilder {
    /// Adds more required mechanisms.
    #[must_use]
    pub fn requiring<'a>(mut self, mechanisms: impl IntoIterator<Item = &'a Mechanism>) -> Self {
        for mechanism in mechanisms {
            self.requirements.add(mechanism.clone());
        }
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the interrupt behavior.
    #[must_use]
    pub fn with_interrupt_behavior(mut self, behavior: InterruptBehavior) -> Self {
        self.interrupt_behavior = behavior;
        self
    }

    /// Sets the body.
    ///
    /// The closure is called once per run to create a fresh future; the
    /// future is then resumed once per tick until it completes.
    #[must_use]
    pub fn executing<F, Fut>(mut self, body: F) -> Self
    where
        F: Fn(Coroutine) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        let erased: Body = Arc::new(move |co: Coroutine| body(co).boxed());
        self.body = Some(erased);
        self
    }

    /// Names the command and finishes building it.
    #[must_use]
    pub fn named(self, name: impl Into<String>) -> Command {
        let footprint = self.requirements.footprint();
        let body: Body = match self.body {
            Some(body) => body,
            None => Arc::new(|_co: Coroutine| futures::future::ready(Ok::<(), CommandError>(())).boxed()),
        };

        Command {
            inner: Arc::new(CommandInner {
                id: CommandId::next(),
                name: name.into(),
                priority: self.priority,
                interrupt_behavior: self.interrupt_behavior,
                requirements: self.requirements,
                footprint,
                body,
            }),
        }
    }
}

impl fmt::Debug for CommandBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuilder")
            .field("requirements", &self.requirements)
            .field("priority", &self.priority)
            .field("interrupt_behavior", &self.interrupt_behavior)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    #[test]
    fn builder_defaults() {
        let command = Command::no_requirements().named("Noop");

        assert_eq!(command.name(), "Noop");
        assert_eq!(command.priority(), Command::DEFAULT_PRIORITY);
        assert_eq!(command.interrupt_behavior(), InterruptBehavior::Cancel);
        assert!(command.requirements().is_empty());
    }

    #[test]
    fn commands_compare_by_identity() {
        let a = Command::no_requirements().named("Same");
        let b = Command::no_requirements().named("Same");

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn requiring_accumulates() {
        let scheduler = Scheduler::new();
        let arm = Mechanism::new("Arm", &scheduler);
        let intake = Mechanism::new("Intake", &scheduler);

        let command = Command::requiring([&arm])
            .requiring([&intake, &arm])
            .named("Both");

        assert_eq!(command.requirements().len(), 2);
        assert!(command.requires(&arm));
        assert!(command.requires(&intake));
    }

    #[test]
    fn requires_sees_nested_mechanisms() {
        let scheduler = Scheduler::new();
        let module = Mechanism::new("Module", &scheduler);
        let drive = Mechanism::with_nested("Drive", &scheduler, [module.clone()]);

        let command = Command::requiring([&drive]).named("Drive");
        assert!(command.requires(&module));
        assert!(!command.requirements().contains(&module));
    }

    #[test]
    fn conflicts_through_nesting() {
        let scheduler = Scheduler::new();
        let module = Mechanism::new("Module", &scheduler);
        let drive = Mechanism::with_nested("Drive", &scheduler, [module.clone()]);
        let arm = Mechanism::new("Arm", &scheduler);

        let whole = Command::requiring([&drive]).named("Whole");
        let part = Command::requiring([&module]).named("Part");
        let other = Command::requiring([&arm]).named("Other");
        let free = Command::no_requirements().named("Free");

        assert!(whole.conflicts_with(&part));
        assert!(part.conflicts_with(&whole));
        assert!(!whole.conflicts_with(&other));
        assert!(!free.conflicts_with(&whole));
    }

    #[test]
    fn priority_comparison_is_strict() {
        let low = Command::no_requirements().with_priority(-5).named("Low");
        let high = Command::no_requirements().with_priority(5).named("High");
        let same = Command::no_requirements().with_priority(5).named("Same");

        assert!(high.is_higher_priority_than(&low));
        assert!(!low.is_higher_priority_than(&high));
        assert!(!high.is_higher_priority_than(&same));
    }
}
