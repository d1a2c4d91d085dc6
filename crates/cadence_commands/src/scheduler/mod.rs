//! The command scheduler.
//!
//! A [`Scheduler`] multiplexes commands over mechanisms inside a fixed-period
//! loop. Each call to [`Scheduler::run`] performs one tick:
//!
//! 1. Resume sideloads (see [`Scheduler::sideload`]).
//! 2. Resolve queued requests against the running set, in submission order.
//! 3. Resume every running command once, newest first.
//! 4. Start default commands for mechanisms left without a holder.
//!
//! A failing body stops the tick at step 3 and surfaces as an
//! [`ExecutionError`]; the scheduler stays usable and the caller is expected
//! to keep ticking.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let intake = Mechanism::new("Intake", &scheduler);
//! let spins = Arc::new(AtomicUsize::new(0));
//!
//! let counter = spins.clone();
//! let spin = intake
//!     .run(move |co| {
//!         let counter = counter.clone();
//!         async move {
//!             while counter.fetch_add(1, Ordering::SeqCst) < 2 {
//!                 co.yield_now().await;
//!             }
//!             Ok(())
//!         }
//!     })
//!     .named("Spin Intake");
//!
//! scheduler.schedule(&spin);
//! for _ in 0..3 {
//!     scheduler.run()?;
//! }
//! assert_eq!(spins.load(Ordering::SeqCst), 3);
//! assert!(!scheduler.is_running(&spin));
//! # Ok::<(), ExecutionError>(())
//! ```

mod state;

use core::fmt;
use core::mem;
use core::panic::AssertUnwindSafe;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Poll};
use std::panic::catch_unwind;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};

use crate::command::{Command, CommandId, CommandResult};
use crate::coroutine::Coroutine;
use crate::error::{CommandError, DefaultCommandError, ExecutionError};
use crate::event::{EventListener, SchedulerEvent};
use crate::mechanism::Mechanism;
use crate::snapshot::SchedulerSnapshot;
use crate::time::{Clock, ClockProvider};

pub(crate) use state::{CompletionSlot, RunOutcome};
use state::{BodyFuture, CommandState, SchedulerState, Sideload};

/// Identifies one run of a command.
///
/// A command scheduled again after it finished gets a new run ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub(crate) u64);

impl RunId {
    /// Returns the raw ID value.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run_{}", self.0)
    }
}

/// What happened to a scheduling request.
///
/// A request that was accepted may still lose conflict resolution when it is
/// promoted; query [`Scheduler::is_running`] after the tick to find out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleResult {
    /// The command was accepted.
    Scheduled,
    /// The command is already queued or running. Nothing changed.
    AlreadyScheduled,
    /// A conflicting command with strictly higher priority keeps its mechanisms.
    LowerPriority,
    /// The forking command stopped running before the child could start.
    ParentNotRunning,
}

pub(crate) struct Shared {
    state: Mutex<SchedulerState>,
    listeners: RwLock<Vec<EventListener>>,
    clock: Clock,
    next_run_id: AtomicU64,
}

impl Shared {
    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Runs `f` under the lock without producing events or retired runs.
    pub(crate) fn peek<T>(&self, f: impl FnOnce(&SchedulerState) -> T) -> T {
        f(&self.state.lock())
    }
}

/// Cooperative, mechanism-aware command scheduler.
///
/// `Scheduler` is a cheap, clonable handle. All clones drive the same
/// scheduler. Execution is single-threaded: bodies only run inside
/// [`run`](Self::run), one at a time.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Creates a scheduler that reads the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for a scheduler with custom configuration.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Returns the clock used for timestamps and waits.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    /// Runs `f` with the lock held, then drops finished runs and delivers
    /// buffered events with the lock released.
    fn with_state<T>(&self, f: impl FnOnce(&mut SchedulerState) -> T) -> T {
        let (value, events, retired, discarded) = {
            let mut state = self.shared.state.lock();
            let value = f(&mut state);
            (
                value,
                mem::take(&mut state.events),
                mem::take(&mut state.retired),
                mem::take(&mut state.discarded),
            )
        };
        drop(retired);
        drop(discarded);
        self.emit(&events);
        value
    }

    fn emit(&self, events: &[SchedulerEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.shared.listeners.read().clone();
        for event in events {
            for listener in &listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                    tracing::warn!(
                        event = event.kind(),
                        command = %event.command(),
                        "Event listener panicked"
                    );
                }
            }
        }
    }

    fn next_run_id(&self) -> RunId {
        RunId(self.shared.next_run_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a fresh run of `command`. The body closure runs here, outside the lock.
    ///
    /// A closure that panics yields a body that fails on its first resumption.
    fn prepare(
        &self,
        command: &Command,
        parent: Option<CommandId>,
        waiter: Option<CompletionSlot>,
    ) -> CommandState {
        let run_id = self.next_run_id();
        let co = Coroutine::for_command(self.downgrade(), command.clone(), run_id);
        let future = match catch_unwind(AssertUnwindSafe(|| command.start(co))) {
            Ok(future) => future,
            Err(payload) => {
                let error = CommandError::from_panic(payload.as_ref());
                tracing::warn!(command = %command, error = %error, "Command body panicked on start");
                futures::future::ready(Err(error)).boxed()
            }
        };
        CommandState::new(command.clone(), run_id, parent, future, waiter)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Requests that a command run.
    ///
    /// Outside of a command body the request is queued and resolved on the
    /// next tick. Called from inside a running body, the command becomes a
    /// child of that body's command and starts immediately.
    pub fn schedule(&self, command: &Command) -> ScheduleResult {
        let parent = self.shared.peek(SchedulerState::current_command_id);
        self.submit(command, parent, None)
    }

    pub(crate) fn submit(
        &self,
        command: &Command,
        parent: Option<CommandId>,
        waiter: Option<CompletionSlot>,
    ) -> ScheduleResult {
        let id = command.id();
        let already = self
            .shared
            .peek(|state| state.is_queued(id) || state.is_running(id));
        if already {
            return ScheduleResult::AlreadyScheduled;
        }

        let state = self.prepare(command, parent, waiter);
        match parent {
            None => self.with_state(|s| s.enqueue(state)),
            Some(_) => {
                let (result, mounted) = self.with_state(|s| (s.start_child(state), s.is_mounted()));
                if result == ScheduleResult::Scheduled && mounted {
                    self.resume_inline(command);
                }
                result
            }
        }
    }

    /// Gives a child started mid-tick its first resumption right away.
    fn resume_inline(&self, command: &Command) {
        if let Err(error) = self.resume(command.id()) {
            self.with_state(|s| {
                let pending = s.deferred_error.as_ref().map(|first| first.command().clone());
                match pending {
                    None => s.deferred_error = Some(error),
                    Some(reported) => tracing::warn!(
                        command = %error.command(),
                        error = %error.error(),
                        reported = %reported,
                        "Child failure not reported; an earlier failure is pending"
                    ),
                }
            });
        }
    }

    /// Cancels a queued or running command and every command it started.
    ///
    /// Its mechanisms are free immediately. Default commands are not started
    /// until the next tick.
    pub fn cancel(&self, command: &Command) {
        self.with_state(|s| s.cancel(command));
    }

    /// Cancels every queued and running command.
    ///
    /// Default commands start on the next tick.
    pub fn cancel_all(&self) {
        self.with_state(SchedulerState::cancel_all);
    }

    /// Sets the default command of a mechanism.
    ///
    /// The command must require exactly that mechanism. If nothing holds or
    /// requests the mechanism, the default is queued for the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`DefaultCommandError`] if the mechanism belongs to another
    /// scheduler or the command requires anything other than the mechanism.
    pub fn set_default_command(
        &self,
        mechanism: &Mechanism,
        command: Command,
    ) -> Result<(), DefaultCommandError> {
        if !mechanism.belongs_to(&self.shared) {
            return Err(DefaultCommandError::ForeignMechanism(
                mechanism.name().to_owned(),
            ));
        }
        if !command.requirements().contains(mechanism) {
            return Err(DefaultCommandError::MissingRequirement {
                mechanism: mechanism.name().to_owned(),
                command: command.name().to_owned(),
            });
        }
        if command.requirements().len() > 1 {
            return Err(DefaultCommandError::ExtraRequirements {
                mechanism: mechanism.name().to_owned(),
                command: command.name().to_owned(),
            });
        }

        tracing::debug!(
            mechanism = %mechanism,
            command = %command,
            "Set default command"
        );
        let idle = self.with_state(|s| s.set_default(mechanism, command.clone()));
        if idle {
            let state = self.prepare(&command, None, None);
            self.with_state(|s| s.enqueue(state));
        }
        Ok(())
    }

    /// Registers a coroutine that is resumed once per tick, before queued
    /// commands are promoted.
    ///
    /// Sideloads require nothing, are never listed as running, and cannot be
    /// canceled. Commands they fork are queued like top-level requests. A
    /// sideload whose body fails is removed and reported from
    /// [`run`](Self::run).
    pub fn sideload<F, Fut>(&self, body: F)
    where
        F: FnOnce(Coroutine) -> Fut,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        let command = Command::no_requirements().named("sideload");
        let co = Coroutine::for_sideload(self.downgrade(), command.clone());
        let future = body(co).boxed();
        self.with_state(|s| s.sideloads.push(Sideload { command, future }));
    }

    /// Calls `callback` once per tick for the lifetime of the scheduler.
    pub fn add_periodic<F>(&self, mut callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.sideload(move |co| async move {
            loop {
                callback();
                if !co.yield_now().await {
                    return Ok::<(), CommandError>(());
                }
            }
        });
    }

    /// Registers a listener for every [`SchedulerEvent`].
    pub fn add_event_listener<F>(&self, listener: F)
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.write().push(Arc::new(listener));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tick
    // ─────────────────────────────────────────────────────────────────────────

    /// Executes one tick.
    ///
    /// Calling `run` from inside a command body or sideload does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError`] for the first body that fails without
    /// anyone awaiting it. That command and its children have already been
    /// removed; commands resumed earlier in the tick keep their effects, and
    /// no further commands are resumed until the next call.
    ///
    /// Only one failure is returned per tick. If a body forks several children
    /// that fail during the same resumption, the first is returned and the
    /// others are logged at `WARN` and dropped. Every one of them is still
    /// removed and emits [`SchedulerEvent::CompletedWithError`].
    pub fn run(&self) -> Result<(), ExecutionError> {
        let entered = self.with_state(|s| !mem::replace(&mut s.in_tick, true));
        if !entered {
            tracing::warn!("Scheduler::run called re-entrantly; ignoring");
            return Ok(());
        }

        let guard = TickGuard {
            shared: &self.shared,
            started: self.shared.clock.now(),
        };
        let result = self.run_tick();
        drop(guard);
        result
    }

    fn run_tick(&self) -> Result<(), ExecutionError> {
        self.run_sideloads()?;
        self.with_state(SchedulerState::promote_queued);

        let order = self.with_state(SchedulerState::begin_commands);
        for id in order {
            self.resume(id)?;
            if let Some(error) = self.with_state(|s| s.deferred_error.take()) {
                return Err(error);
            }
        }

        self.start_defaults();
        Ok(())
    }

    fn run_sideloads(&self) -> Result<(), ExecutionError> {
        let sideloads = self.with_state(|s| mem::take(&mut s.sideloads));
        let mut kept = Vec::with_capacity(sideloads.len());
        let mut failure = None;

        for mut sideload in sideloads {
            if failure.is_some() {
                kept.push(sideload);
                continue;
            }
            match poll_body(&mut sideload.future) {
                Poll::Pending => kept.push(sideload),
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(error)) => {
                    tracing::warn!(error = %error, "Sideload failed");
                    failure = Some(ExecutionError::new(sideload.command, error));
                }
            }
        }

        self.with_state(|s| {
            kept.append(&mut s.sideloads);
            s.sideloads = kept;
        });
        failure.map_or(Ok(()), Err)
    }

    /// Resumes one running command, if it has not been resumed this tick.
    fn resume(&self, id: CommandId) -> Result<(), ExecutionError> {
        let Some((command, run_id, mut future)) = self.with_state(|s| s.mount(id)) else {
            return Ok(());
        };

        tracing::trace!(command = %command, "Resuming command");
        let started = self.shared.clock.now();
        let poll = poll_body(&mut future);
        let elapsed = self.shared.clock.elapsed_since(started);

        self.with_state(|s| s.unmount(&command, run_id, future, poll, elapsed))
    }

    fn start_defaults(&self) {
        let idle = self.with_state(|s| s.idle_defaults());
        for command in idle {
            let state = self.prepare(&command, None, None);
            self.with_state(|s| s.start_default(state));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Returns `true` if the command is in the running set.
    #[must_use]
    pub fn is_running(&self, command: &Command) -> bool {
        self.shared.peek(|s| s.is_running(command.id()))
    }

    /// Returns `true` if the command is queued for the next tick.
    #[must_use]
    pub fn is_scheduled(&self, command: &Command) -> bool {
        self.shared.peek(|s| s.is_queued(command.id()))
    }

    /// Returns `true` if the command is queued or running.
    #[must_use]
    pub fn is_scheduled_or_running(&self, command: &Command) -> bool {
        self.shared
            .peek(|s| s.is_queued(command.id()) || s.is_running(command.id()))
    }

    /// Returns every running command, in promotion order.
    #[must_use]
    pub fn running_commands(&self) -> Vec<Command> {
        self.shared.peek(SchedulerState::running_commands)
    }

    /// Returns the running commands that hold the mechanism or any mechanism
    /// nested in it, in promotion order.
    #[must_use]
    pub fn running_commands_for(&self, mechanism: &Mechanism) -> Vec<Command> {
        self.shared.peek(|s| s.running_commands_for(mechanism))
    }

    /// Returns the running command that currently holds exactly this mechanism.
    #[must_use]
    pub fn holder_of(&self, mechanism: &Mechanism) -> Option<Command> {
        self.shared.peek(|s| s.holder_of(mechanism))
    }

    /// Returns the commands queued for the next tick, in submission order.
    #[must_use]
    pub fn queued_commands(&self) -> Vec<Command> {
        self.shared.peek(SchedulerState::queued_commands)
    }

    /// Returns the command whose body is currently executing, if any.
    #[must_use]
    pub fn current_command(&self) -> Option<Command> {
        self.shared.peek(SchedulerState::current_command)
    }

    /// Returns the running command that forked `command`.
    #[must_use]
    pub fn parent_of(&self, command: &Command) -> Option<Command> {
        self.shared.peek(|s| s.parent_of(command.id()))
    }

    /// Returns the ID of the command's current run.
    #[must_use]
    pub fn run_id(&self, command: &Command) -> Option<RunId> {
        self.shared.peek(|s| s.run_id(command.id()))
    }

    /// Returns how long the command's most recent resumption took.
    #[must_use]
    pub fn last_command_runtime(&self, command: &Command) -> Option<Duration> {
        self.shared.peek(|s| s.last_runtime(command.id()))
    }

    /// Returns how long the command's current run has spent in its body.
    #[must_use]
    pub fn total_command_runtime(&self, command: &Command) -> Option<Duration> {
        self.shared.peek(|s| s.total_runtime(command.id()))
    }

    /// Returns how long the most recent tick took.
    #[must_use]
    pub fn last_run_time(&self) -> Option<Duration> {
        self.shared.peek(|s| s.last_run_time)
    }

    /// Returns the default command of a mechanism.
    #[must_use]
    pub fn default_command_for(&self, mechanism: &Mechanism) -> Option<Command> {
        self.shared.peek(|s| s.default_for(mechanism))
    }

    /// Captures a serializable view of the queued and running commands.
    #[must_use]
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.shared.peek(SchedulerState::snapshot)
    }

    pub(crate) fn is_live(&self, id: CommandId, run_id: RunId) -> bool {
        self.shared.peek(|s| s.is_live(id, run_id))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (queued, running) = self
            .shared
            .peek(|s| (s.queued_commands().len(), s.running_commands().len()));
        f.debug_struct("Scheduler")
            .field("queued", &queued)
            .field("running", &running)
            .finish_non_exhaustive()
    }
}

/// Closes the tick when dropped, so a panic unwinding out of
/// [`Scheduler::run`] cannot leave the scheduler stuck mid-tick.
struct TickGuard<'a> {
    shared: &'a Shared,
    started: Instant,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.shared.clock.elapsed_since(self.started);
        self.shared.state.lock().end_tick(elapsed);
    }
}

/// Polls a body once with a no-op waker, converting a panic into an error.
fn poll_body(future: &mut BodyFuture) -> Poll<CommandResult> {
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
        Ok(poll) => poll,
        Err(payload) => Poll::Ready(Err(CommandError::from_panic(payload.as_ref()))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SchedulerBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Scheduler`].
#[derive(Debug, Default)]
pub struct SchedulerBuilder {
    clock: Clock,
}

impl SchedulerBuilder {
    /// Reads time from a custom provider instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, provider: Arc<dyn ClockProvider>) -> Self {
        self.clock = Clock::with_provider(provider);
        self
    }

    /// Builds the scheduler.
    #[must_use]
    pub fn build(self) -> Scheduler {
        Scheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::new(self.clock.clone())),
                listeners: RwLock::new(Vec::new()),
                clock: self.clock,
                next_run_id: AtomicU64::new(1),
            }),
        }
    }
}
