//! Commands bound to boolean conditions.
//!
//! A [`Trigger`] samples its condition once per tick, before queued commands
//! are promoted, and schedules or cancels its bound commands when the
//! sampled value changes. Commands scheduled this way start in the same tick
//! the change is seen.
//!
//! The first sample counts as a change: a condition that is already true
//! fires [`on_true`](Trigger::on_true) bindings on the first tick, and one
//! that is false fires [`on_false`](Trigger::on_false) bindings.
//!
//! # Scope
//!
//! A binding made while a command body is executing belongs to that run of
//! the command. The bound command starts as its child, and the binding is
//! dropped once the run ends. Bindings made anywhere else last as long as
//! the scheduler.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let intake = Mechanism::new("Intake", &scheduler);
//! let pressed = Arc::new(AtomicBool::new(false));
//!
//! let button = pressed.clone();
//! let spin = intake.run(|co| async move { co.park().await }).named("Spin");
//! Trigger::new(&scheduler, move || button.load(Ordering::SeqCst)).while_true(&spin);
//!
//! pressed.store(true, Ordering::SeqCst);
//! scheduler.run()?;
//! assert!(scheduler.is_running(&spin));
//!
//! pressed.store(false, Ordering::SeqCst);
//! scheduler.run()?;
//! assert!(!scheduler.is_running(&spin));
//! # Ok::<(), ExecutionError>(())
//! ```

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::command::{Command, CommandId};
use crate::scheduler::{RunId, Scheduler, Shared};
use crate::time::Clock;

type Condition = Box<dyn FnMut() -> bool + Send>;

/// When a binding acts on its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BindingKind {
    ScheduleOnRise,
    ScheduleOnFall,
    RunWhileHigh,
    RunWhileLow,
    ToggleOnRise,
    ToggleOnFall,
}

/// How long a binding stays in effect.
#[derive(Debug, Clone)]
enum BindingScope {
    Global,
    ForCommand { owner: Command, run_id: RunId },
}

impl BindingScope {
    /// Scope for a binding made right now.
    fn current(scheduler: &Scheduler) -> Self {
        scheduler
            .current_command()
            .and_then(|owner| {
                let run_id = scheduler.run_id(&owner)?;
                Some(Self::ForCommand { owner, run_id })
            })
            .unwrap_or(Self::Global)
    }

    fn is_active(&self, scheduler: &Scheduler) -> bool {
        match self {
            Self::Global => true,
            Self::ForCommand { owner, run_id } => scheduler.is_live(owner.id(), *run_id),
        }
    }

    fn parent(&self) -> Option<CommandId> {
        match self {
            Self::Global => None,
            Self::ForCommand { owner, .. } => Some(owner.id()),
        }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    kind: BindingKind,
    command: Command,
    scope: BindingScope,
}

/// The last two samples. `None` until the trigger has been polled.
#[derive(Debug, Clone, Copy, Default)]
struct Signal {
    previous: Option<bool>,
    current: Option<bool>,
}

struct TriggerInner {
    scheduler: Weak<Shared>,
    condition: Mutex<Condition>,
    signal: Mutex<Signal>,
    bindings: Mutex<Vec<Binding>>,
    bound: AtomicBool,
    /// Polled before this trigger.
    dependencies: Vec<Trigger>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Trigger
// ─────────────────────────────────────────────────────────────────────────────

/// A boolean condition that schedules and cancels commands as it changes.
///
/// `Trigger` is a cheap, clonable handle. A trigger is polled only once
/// something is bound to it (or to a trigger derived from it), and from then
/// on for the lifetime of its scheduler.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

impl Trigger {
    /// Creates a trigger that samples `condition` on `scheduler`.
    #[must_use]
    pub fn new<F>(scheduler: &Scheduler, condition: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::with_dependencies(scheduler.downgrade(), Box::new(condition), Vec::new())
    }

    fn with_dependencies(
        scheduler: Weak<Shared>,
        condition: Condition,
        dependencies: Vec<Trigger>,
    ) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                scheduler,
                condition: Mutex::new(condition),
                signal: Mutex::new(Signal::default()),
                bindings: Mutex::new(Vec::new()),
                bound: AtomicBool::new(false),
                dependencies,
            }),
        }
    }

    /// Creates a trigger computed from this trigger's latest sample.
    fn derive<F>(&self, dependencies: Vec<Trigger>, condition: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::with_dependencies(self.inner.scheduler.clone(), Box::new(condition), dependencies)
    }

    fn scheduler(&self) -> Option<Scheduler> {
        self.inner.scheduler.upgrade().map(Scheduler::from_shared)
    }

    /// Returns the value sampled on the most recent tick.
    ///
    /// `false` until the trigger has been polled.
    #[must_use]
    pub fn get(&self) -> bool {
        self.inner.signal.lock().current == Some(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bindings
    // ─────────────────────────────────────────────────────────────────────────

    /// Schedules `command` each time the condition becomes true.
    pub fn on_true(&self, command: &Command) -> &Self {
        self.bind(BindingKind::ScheduleOnRise, command)
    }

    /// Schedules `command` each time the condition becomes false.
    pub fn on_false(&self, command: &Command) -> &Self {
        self.bind(BindingKind::ScheduleOnFall, command)
    }

    /// Schedules `command` when the condition becomes true and cancels it
    /// when the condition becomes false.
    pub fn while_true(&self, command: &Command) -> &Self {
        self.bind(BindingKind::RunWhileHigh, command)
    }

    /// Schedules `command` when the condition becomes false and cancels it
    /// when the condition becomes true.
    pub fn while_false(&self, command: &Command) -> &Self {
        self.bind(BindingKind::RunWhileLow, command)
    }

    /// Each time the condition becomes true, cancels `command` if it is
    /// queued or running and schedules it otherwise.
    pub fn toggle_on_true(&self, command: &Command) -> &Self {
        self.bind(BindingKind::ToggleOnRise, command)
    }

    /// Each time the condition becomes false, cancels `command` if it is
    /// queued or running and schedules it otherwise.
    pub fn toggle_on_false(&self, command: &Command) -> &Self {
        self.bind(BindingKind::ToggleOnFall, command)
    }

    fn bind(&self, kind: BindingKind, command: &Command) -> &Self {
        let Some(scheduler) = self.scheduler() else {
            return self;
        };
        let scope = BindingScope::current(&scheduler);
        tracing::debug!(
            command = %command,
            kind = ?kind,
            scope = ?scope.parent(),
            "Bound command to trigger"
        );
        self.inner.bindings.lock().push(Binding {
            kind,
            command: command.clone(),
            scope,
        });
        self.ensure_bound(&scheduler);
        self
    }

    /// Registers the polling sideload, after those of every dependency.
    fn ensure_bound(&self, scheduler: &Scheduler) {
        if self.inner.bound.swap(true, Ordering::SeqCst) {
            return;
        }
        for dependency in &self.inner.dependencies {
            dependency.ensure_bound(scheduler);
        }
        let trigger = self.clone();
        scheduler.add_periodic(move || trigger.poll());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Composition
    // ─────────────────────────────────────────────────────────────────────────

    /// Returns a trigger that is true while both triggers are true.
    #[must_use]
    pub fn and(&self, other: &Trigger) -> Trigger {
        let (a, b) = (self.clone(), other.clone());
        self.derive(vec![self.clone(), other.clone()], move || a.get() && b.get())
    }

    /// Returns a trigger that is true while either trigger is true.
    #[must_use]
    pub fn or(&self, other: &Trigger) -> Trigger {
        let (a, b) = (self.clone(), other.clone());
        self.derive(vec![self.clone(), other.clone()], move || a.get() || b.get())
    }

    /// Returns a trigger that is true while this one is false.
    #[must_use]
    pub fn negate(&self) -> Trigger {
        let source = self.clone();
        self.derive(vec![self.clone()], move || !source.get())
    }

    /// Returns a trigger that is true only on the tick this one becomes true.
    #[must_use]
    pub fn rising_edge(&self) -> Trigger {
        let source = self.clone();
        self.derive(vec![self.clone()], move || {
            let signal = *source.inner.signal.lock();
            signal.current == Some(true) && signal.previous != Some(true)
        })
    }

    /// Returns a trigger that is true only on the tick this one becomes false.
    #[must_use]
    pub fn falling_edge(&self) -> Trigger {
        let source = self.clone();
        self.derive(vec![self.clone()], move || {
            let signal = *source.inner.signal.lock();
            signal.current == Some(false) && signal.previous != Some(false)
        })
    }

    /// Returns a trigger that only becomes true after this one has stayed
    /// true for `duration`. It becomes false immediately.
    #[must_use]
    pub fn debounce(&self, duration: Duration) -> Trigger {
        self.debounce_with(duration, DebounceKind::Rising)
    }

    /// Returns a trigger that follows this one only once a new value has
    /// held for `duration`, on the edges selected by `kind`.
    #[must_use]
    pub fn debounce_with(&self, duration: Duration, kind: DebounceKind) -> Trigger {
        let clock = self
            .inner
            .scheduler
            .upgrade()
            .map(|shared| shared.clock().clone())
            .unwrap_or_default();
        let mut debouncer = Debouncer::new(duration, kind, clock.now());
        let source = self.clone();
        self.derive(vec![self.clone()], move || {
            debouncer.calculate(source.get(), clock.now())
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Polling
    // ─────────────────────────────────────────────────────────────────────────

    fn poll(&self) {
        let Some(scheduler) = self.scheduler() else {
            return;
        };
        self.clear_stale_bindings(&scheduler);

        let value = {
            let mut condition = self.inner.condition.lock();
            (*condition)()
        };
        let changed = {
            let mut signal = self.inner.signal.lock();
            signal.previous = signal.current;
            signal.current = Some(value);
            signal.previous != signal.current
        };
        if !changed {
            return;
        }

        tracing::trace!(value, "Trigger changed");
        if value {
            self.schedule_bindings(&scheduler, BindingKind::ScheduleOnRise);
            self.schedule_bindings(&scheduler, BindingKind::RunWhileHigh);
            self.cancel_bindings(&scheduler, BindingKind::RunWhileLow);
            self.toggle_bindings(&scheduler, BindingKind::ToggleOnRise);
        } else {
            self.schedule_bindings(&scheduler, BindingKind::ScheduleOnFall);
            self.schedule_bindings(&scheduler, BindingKind::RunWhileLow);
            self.cancel_bindings(&scheduler, BindingKind::RunWhileHigh);
            self.toggle_bindings(&scheduler, BindingKind::ToggleOnFall);
        }
    }

    /// Drops bindings whose owning run has ended and cancels their commands.
    fn clear_stale_bindings(&self, scheduler: &Scheduler) {
        let stale: Vec<Binding> = {
            let mut bindings = self.inner.bindings.lock();
            let (active, stale) = bindings
                .drain(..)
                .partition(|binding| binding.scope.is_active(scheduler));
            *bindings = active;
            stale
        };
        for binding in stale {
            tracing::debug!(command = %binding.command, "Dropped stale trigger binding");
            scheduler.cancel(&binding.command);
        }
    }

    fn bindings_of(&self, kind: BindingKind) -> Vec<Binding> {
        self.inner
            .bindings
            .lock()
            .iter()
            .filter(|binding| binding.kind == kind)
            .cloned()
            .collect()
    }

    fn schedule_bindings(&self, scheduler: &Scheduler, kind: BindingKind) {
        for binding in self.bindings_of(kind) {
            scheduler.submit(&binding.command, binding.scope.parent(), None);
        }
    }

    fn cancel_bindings(&self, scheduler: &Scheduler, kind: BindingKind) {
        for binding in self.bindings_of(kind) {
            scheduler.cancel(&binding.command);
        }
    }

    fn toggle_bindings(&self, scheduler: &Scheduler, kind: BindingKind) {
        for binding in self.bindings_of(kind) {
            if scheduler.is_scheduled_or_running(&binding.command) {
                scheduler.cancel(&binding.command);
            } else {
                scheduler.submit(&binding.command, binding.scope.parent(), None);
            }
        }
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("signal", &*self.inner.signal.lock())
            .field("bindings", &self.inner.bindings.lock().len())
            .field("bound", &self.inner.bound.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Debouncer
// ─────────────────────────────────────────────────────────────────────────────

/// Which changes a debounced trigger delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DebounceKind {
    /// Delay false-to-true changes.
    #[default]
    Rising,
    /// Delay true-to-false changes.
    Falling,
    /// Delay both.
    Both,
}

#[derive(Debug)]
struct Debouncer {
    duration: Duration,
    kind: DebounceKind,
    baseline: bool,
    stable_since: Instant,
}

impl Debouncer {
    fn new(duration: Duration, kind: DebounceKind, now: Instant) -> Self {
        Self {
            duration,
            kind,
            baseline: kind == DebounceKind::Falling,
            stable_since: now,
        }
    }

    fn calculate(&mut self, input: bool, now: Instant) -> bool {
        if input == self.baseline {
            self.stable_since = now;
        }
        if now.saturating_duration_since(self.stable_since) >= self.duration {
            if self.kind == DebounceKind::Both {
                self.baseline = input;
                self.stable_since = now;
            }
            return input;
        }
        self.baseline
    }
}
