//! Mechanisms: exclusively-owned units of contention.
//!
//! A [`Mechanism`] models a physical subsystem (a drivetrain, an elevator, an
//! intake roller). At most one running command may hold a mechanism at any
//! instant; the [`Scheduler`] enforces this through priority-based conflict
//! resolution.
//!
//! Mechanisms may be composed of other mechanisms. A drivetrain composed of
//! four swerve modules has a *footprint* of five mechanisms: requiring the
//! drivetrain implicitly requires every module, and a command requiring a
//! single module conflicts with a command requiring the whole drivetrain.
//!
//! # Example
//!
//! ```
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let front = Mechanism::new("Front Module", &scheduler);
//! let back = Mechanism::new("Back Module", &scheduler);
//! let drive = Mechanism::with_nested("Drive", &scheduler, [front.clone(), back.clone()]);
//!
//! assert_eq!(drive.footprint().len(), 3);
//! assert!(drive.footprint().contains(&front));
//! ```

use core::fmt;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::command::{Command, CommandBuilder, CommandResult};
use crate::coroutine::Coroutine;
use crate::error::DefaultCommandError;
use crate::requirements::Requirements;
use crate::scheduler::{Scheduler, Shared};

static NEXT_MECHANISM_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a [`Mechanism`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MechanismId(u64);

impl MechanismId {
    fn next() -> Self {
        Self(NEXT_MECHANISM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for MechanismId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mechanism_{}", self.0)
    }
}

struct MechanismInner {
    id: MechanismId,
    name: String,
    nested: Vec<Mechanism>,
    scheduler: Weak<Shared>,
}

/// An exclusively-ownable unit of contention, bound to one scheduler.
///
/// `Mechanism` is a cheap, clonable handle. Clones share identity: equality
/// and hashing use the mechanism's [`MechanismId`], never its name.
///
/// The default command slot lives in the owning [`Scheduler`]; the mechanism
/// only keeps a weak reference to it, so dropping every scheduler handle
/// never leaks through mechanisms.
#[derive(Clone)]
pub struct Mechanism {
    inner: Arc<MechanismInner>,
}

impl Mechanism {
    /// Creates a mechanism with no nested mechanisms.
    #[must_use]
    pub fn new(name: impl Into<String>, scheduler: &Scheduler) -> Self {
        Self::with_nested(name, scheduler, std::iter::empty())
    }

    /// Creates a mechanism composed of the given nested mechanisms.
    ///
    /// Requiring this mechanism requires every nested mechanism, transitively.
    #[must_use]
    pub fn with_nested(
        name: impl Into<String>,
        scheduler: &Scheduler,
        nested: impl IntoIterator<Item = Mechanism>,
    ) -> Self {
        Self {
            inner: Arc::new(MechanismInner {
                id: MechanismId::next(),
                name: name.into(),
                nested: nested.into_iter().collect(),
                scheduler: scheduler.downgrade(),
            }),
        }
    }

    /// Returns this mechanism's identity.
    #[must_use]
    pub fn id(&self) -> MechanismId {
        self.inner.id
    }

    /// Returns the mechanism's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the mechanisms this one is directly composed of.
    #[must_use]
    pub fn nested_mechanisms(&self) -> &[Mechanism] {
        &self.inner.nested
    }

    /// Returns this mechanism plus every nested mechanism, transitively.
    #[must_use]
    pub fn footprint(&self) -> Requirements {
        Requirements::from_iter([self.clone()]).footprint()
    }

    /// Returns the scheduler this mechanism is bound to, if it is still alive.
    #[must_use]
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.inner.scheduler.upgrade().map(Scheduler::from_shared)
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        core::ptr::eq(self.inner.scheduler.as_ptr(), Arc::as_ptr(shared))
    }

    /// Sets the command to run whenever nothing else holds this mechanism.
    ///
    /// The command must require exactly this mechanism. Replacing a default
    /// command does not affect any command that is currently running.
    ///
    /// # Errors
    ///
    /// Returns [`DefaultCommandError`] if the command requires anything other
    /// than this mechanism, or if the owning scheduler has been dropped.
    pub fn set_default_command(&self, command: Command) -> Result<(), DefaultCommandError> {
        let scheduler = self
            .scheduler()
            .ok_or_else(|| DefaultCommandError::SchedulerDropped(self.name().to_owned()))?;
        scheduler.set_default_command(self, command)
    }

    /// Returns the default command, if one has been set.
    #[must_use]
    pub fn default_command(&self) -> Option<Command> {
        self.scheduler()
            .and_then(|scheduler| scheduler.default_command_for(self))
    }

    /// Returns the running commands holding this mechanism or any of its
    /// nested mechanisms.
    #[must_use]
    pub fn running_commands(&self) -> Vec<Command> {
        self.scheduler()
            .map(|scheduler| scheduler.running_commands_for(self))
            .unwrap_or_default()
    }

    /// Starts building a command that requires this mechanism.
    #[must_use]
    pub fn run<F, Fut>(&self, body: F) -> CommandBuilder
    where
        F: Fn(Coroutine) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        Command::requiring([self]).executing(body)
    }

    /// Returns a lowest-priority command that holds this mechanism and does nothing.
    #[must_use]
    pub fn idle(&self) -> Command {
        self.run(|co| async move { co.park().await })
            .with_priority(Command::LOWEST_PRIORITY)
            .named(format!("{}[IDLE]", self.name()))
    }
}

impl PartialEq for Mechanism {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Mechanism {}

impl Hash for Mechanism {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mechanism")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}
