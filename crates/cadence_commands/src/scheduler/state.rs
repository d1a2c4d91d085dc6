//! Bookkeeping guarded by the scheduler lock.
//!
//! Nothing in this module polls a command body, drops a body's future, or
//! invokes a listener. Events are buffered in [`SchedulerState::events`] and
//! finished runs in [`SchedulerState::retired`]; the owning
//! [`Scheduler`](super::Scheduler) drains both once the lock is released.

use core::mem;
use core::task::Poll;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use parking_lot::Mutex;

use super::{RunId, ScheduleResult};
use crate::command::{Command, CommandId, CommandResult};
use crate::error::{CommandError, ExecutionError};
use crate::event::SchedulerEvent;
use crate::mechanism::{Mechanism, MechanismId};
use crate::snapshot::{CommandSnapshot, SchedulerSnapshot};
use crate::time::Clock;

pub(crate) type BodyFuture = BoxFuture<'static, CommandResult>;

/// Receives the outcome of a run that someone is waiting on.
pub(crate) type CompletionSlot = Arc<Mutex<Option<RunOutcome>>>;

/// How a run ended, as seen by whoever awaits it.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Completed,
    Canceled,
    Failed(CommandError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-run state
// ─────────────────────────────────────────────────────────────────────────────

/// Execution state of one run of a command.
pub(crate) struct CommandState {
    command: Command,
    run_id: RunId,
    parent: Option<CommandId>,
    /// `None` while the body is being polled.
    future: Option<BodyFuture>,
    waiter: Option<CompletionSlot>,
    last_resumed: Option<u64>,
    last_runtime: Duration,
    total_runtime: Duration,
}

impl CommandState {
    pub(crate) fn new(
        command: Command,
        run_id: RunId,
        parent: Option<CommandId>,
        future: BodyFuture,
        waiter: Option<CompletionSlot>,
    ) -> Self {
        Self {
            command,
            run_id,
            parent,
            future: Some(future),
            waiter,
            last_resumed: None,
            last_runtime: Duration::ZERO,
            total_runtime: Duration::ZERO,
        }
    }

    fn id(&self) -> CommandId {
        self.command.id()
    }
}

/// A coroutine resumed every tick that is not a command.
pub(crate) struct Sideload {
    pub(crate) command: Command,
    pub(crate) future: BodyFuture,
}

// ─────────────────────────────────────────────────────────────────────────────
// SchedulerState
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct SchedulerState {
    clock: Clock,
    tick: u64,
    pub(crate) in_tick: bool,
    defaults: IndexMap<MechanismId, (Mechanism, Command)>,
    queued: IndexMap<CommandId, CommandState>,
    /// Promotion order.
    running: IndexMap<CommandId, CommandState>,
    /// Which running command currently holds each mechanism.
    owners: HashMap<MechanismId, CommandId>,
    /// Commands whose bodies are on the call stack, innermost last.
    mounted: Vec<CommandId>,
    pub(crate) sideloads: Vec<Sideload>,
    pub(crate) last_run_time: Option<Duration>,
    /// Failure of an un-awaited child started inline; reported by the tick.
    pub(crate) deferred_error: Option<ExecutionError>,
    pub(crate) events: Vec<SchedulerEvent>,
    pub(crate) retired: Vec<CommandState>,
    pub(crate) discarded: Vec<BodyFuture>,
}

impl SchedulerState {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            clock,
            tick: 0,
            in_tick: false,
            defaults: IndexMap::new(),
            queued: IndexMap::new(),
            running: IndexMap::new(),
            owners: HashMap::new(),
            mounted: Vec::new(),
            sideloads: Vec::new(),
            last_run_time: None,
            deferred_error: None,
            events: Vec::new(),
            retired: Vec::new(),
            discarded: Vec::new(),
        }
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn is_running(&self, id: CommandId) -> bool {
        self.running.contains_key(&id)
    }

    pub(crate) fn is_queued(&self, id: CommandId) -> bool {
        self.queued.contains_key(&id)
    }

    fn contains(&self, id: CommandId) -> bool {
        self.is_queued(id) || self.is_running(id)
    }

    /// Returns `true` if the given run of the command is still running.
    pub(crate) fn is_live(&self, id: CommandId, run_id: RunId) -> bool {
        self.running.get(&id).is_some_and(|state| state.run_id == run_id)
    }

    pub(crate) fn is_mounted(&self) -> bool {
        !self.mounted.is_empty()
    }

    pub(crate) fn current_command(&self) -> Option<Command> {
        self.mounted
            .last()
            .and_then(|id| self.running.get(id))
            .map(|state| state.command.clone())
    }

    pub(crate) fn current_command_id(&self) -> Option<CommandId> {
        self.current_command().map(|command| command.id())
    }

    pub(crate) fn running_commands(&self) -> Vec<Command> {
        self.running.values().map(|state| state.command.clone()).collect()
    }

    pub(crate) fn queued_commands(&self) -> Vec<Command> {
        self.queued.values().map(|state| state.command.clone()).collect()
    }

    /// Running commands holding any mechanism in the footprint, in promotion order.
    pub(crate) fn running_commands_for(&self, mechanism: &Mechanism) -> Vec<Command> {
        let holders: HashSet<CommandId> = mechanism
            .footprint()
            .iter()
            .filter_map(|m| self.owners.get(&m.id()).copied())
            .collect();
        self.running
            .values()
            .filter(|state| holders.contains(&state.id()))
            .map(|state| state.command.clone())
            .collect()
    }

    pub(crate) fn holder_of(&self, mechanism: &Mechanism) -> Option<Command> {
        self.owners
            .get(&mechanism.id())
            .and_then(|id| self.running.get(id))
            .map(|state| state.command.clone())
    }

    pub(crate) fn parent_of(&self, id: CommandId) -> Option<Command> {
        self.running
            .get(&id)
            .and_then(|state| state.parent)
            .and_then(|parent| self.running.get(&parent))
            .map(|state| state.command.clone())
    }

    pub(crate) fn run_id(&self, id: CommandId) -> Option<RunId> {
        self.running.get(&id).map(|state| state.run_id)
    }

    pub(crate) fn last_runtime(&self, id: CommandId) -> Option<Duration> {
        self.running.get(&id).map(|state| state.last_runtime)
    }

    pub(crate) fn total_runtime(&self, id: CommandId) -> Option<Duration> {
        self.running.get(&id).map(|state| state.total_runtime)
    }

    pub(crate) fn default_for(&self, mechanism: &Mechanism) -> Option<Command> {
        self.defaults
            .get(&mechanism.id())
            .map(|(_, command)| command.clone())
    }

    pub(crate) fn snapshot(&self) -> SchedulerSnapshot {
        let describe = |state: &CommandState| CommandSnapshot {
            run_id: state.run_id.index(),
            parent_run_id: state
                .parent
                .and_then(|parent| self.running.get(&parent))
                .map(|parent| parent.run_id.index()),
            name: state.command.name().to_owned(),
            priority: state.command.priority(),
            requirements: state
                .command
                .requirements()
                .iter()
                .map(|m| m.name().to_owned())
                .collect(),
            last_time_ms: millis(state.last_runtime),
            total_time_ms: millis(state.total_runtime),
        };

        SchedulerSnapshot {
            last_run_time_ms: self.last_run_time.map(millis).unwrap_or_default(),
            queued: self.queued.values().map(describe).collect(),
            running: self.running.values().map(describe).collect(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────

    /// Queues a top-level request for the next tick.
    ///
    /// Requests already queued that conflict with it are replaced unless one
    /// of them has strictly higher priority, in which case this one is dropped.
    pub(crate) fn enqueue(&mut self, state: CommandState) -> ScheduleResult {
        let command = state.command.clone();
        if self.contains(command.id()) {
            self.retired.push(state);
            return ScheduleResult::AlreadyScheduled;
        }

        let conflicting: Vec<CommandId> = self
            .queued
            .values()
            .filter(|queued| queued.command.conflicts_with(&command))
            .map(CommandState::id)
            .collect();

        let outranked = conflicting.iter().any(|id| {
            self.queued
                .get(id)
                .is_some_and(|queued| queued.command.is_higher_priority_than(&command))
        });
        if outranked {
            tracing::debug!(
                command = %command,
                "Dropped request: a conflicting queued command has higher priority"
            );
            self.retired.push(state);
            return ScheduleResult::LowerPriority;
        }

        for id in conflicting {
            if let Some(evicted) = self.queued.shift_remove(&id) {
                tracing::debug!(
                    command = %evicted.command,
                    interrupter = %command,
                    "Replaced queued command"
                );
                let at = self.now();
                self.events.push(SchedulerEvent::Interrupted {
                    command: evicted.command.clone(),
                    interrupter: command.clone(),
                    at,
                });
                self.events.push(SchedulerEvent::Canceled {
                    command: evicted.command.clone(),
                    at,
                });
                self.settle(evicted, RunOutcome::Canceled);
            }
        }

        let at = self.now();
        self.events.push(SchedulerEvent::Scheduled {
            command: command.clone(),
            at,
        });
        self.queued.insert(command.id(), state);
        ScheduleResult::Scheduled
    }

    /// Starts a child of a running command immediately, skipping the queue.
    ///
    /// Ancestors of the child never count as conflicts; mechanisms they hold
    /// are lent to the child until it exits.
    pub(crate) fn start_child(&mut self, state: CommandState) -> ScheduleResult {
        let command = state.command.clone();
        if self.contains(command.id()) {
            self.retired.push(state);
            return ScheduleResult::AlreadyScheduled;
        }
        let parent = match state.parent {
            Some(parent) if self.is_running(parent) => parent,
            _ => {
                self.retired.push(state);
                return ScheduleResult::ParentNotRunning;
            }
        };

        let ancestors = self.lineage(Some(parent));
        let Some(roots) = self.resolve(&command, &ancestors) else {
            tracing::debug!(
                command = %command,
                "Dropped child: a conflicting running command has higher priority"
            );
            self.retired.push(state);
            return ScheduleResult::LowerPriority;
        };

        let at = self.now();
        self.events.push(SchedulerEvent::Scheduled {
            command: command.clone(),
            at,
        });
        self.evict(roots, &command);
        self.promote(state);
        ScheduleResult::Scheduled
    }

    /// Resolves every queued request against the running set, in submission order.
    pub(crate) fn promote_queued(&mut self) {
        let queued = mem::take(&mut self.queued);
        let no_ancestors = HashSet::new();

        for (_, state) in queued {
            let command = state.command.clone();
            match self.resolve(&command, &no_ancestors) {
                Some(roots) => {
                    self.evict(roots, &command);
                    tracing::debug!(command = %command, "Promoted command");
                    self.promote(state);
                }
                None => {
                    tracing::debug!(
                        command = %command,
                        "Dropped request: a conflicting running command has higher priority"
                    );
                    let at = self.now();
                    self.events.push(SchedulerEvent::Canceled { command, at });
                    self.settle(state, RunOutcome::Canceled);
                }
            }
        }
    }

    /// The command and every running ancestor of it.
    fn lineage(&self, start: Option<CommandId>) -> HashSet<CommandId> {
        let mut lineage = HashSet::new();
        let mut cursor = start;
        while let Some(id) = cursor {
            let Some(state) = self.running.get(&id) else {
                break;
            };
            lineage.insert(id);
            cursor = state.parent;
        }
        lineage
    }

    /// Decides whether `incoming` may take its mechanisms.
    ///
    /// Returns `None` if a conflicting running command outranks it, otherwise
    /// the roots of every branch that has to be torn down.
    fn resolve(
        &self,
        incoming: &Command,
        ancestors: &HashSet<CommandId>,
    ) -> Option<Vec<CommandId>> {
        let conflicting: Vec<&CommandState> = self
            .running
            .values()
            .filter(|state| !ancestors.contains(&state.id()))
            .filter(|state| state.command.conflicts_with(incoming))
            .collect();

        if conflicting
            .iter()
            .any(|state| state.command.is_higher_priority_than(incoming))
        {
            return None;
        }

        let mut roots = Vec::with_capacity(conflicting.len());
        for state in conflicting {
            let root = self.eviction_root(state.id(), ancestors);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        Some(roots)
    }

    /// Highest running ancestor of `id` that is not also an ancestor of the
    /// incoming command.
    fn eviction_root(&self, mut id: CommandId, ancestors: &HashSet<CommandId>) -> CommandId {
        while let Some(parent) = self.running.get(&id).and_then(|state| state.parent) {
            if ancestors.contains(&parent) || !self.is_running(parent) {
                break;
            }
            id = parent;
        }
        id
    }

    fn evict(&mut self, roots: Vec<CommandId>, interrupter: &Command) {
        for root in roots {
            let Some(victim) = self.running.get(&root).map(|state| state.command.clone()) else {
                continue;
            };
            tracing::debug!(
                command = %victim,
                interrupter = %interrupter,
                "Interrupted command"
            );
            let at = self.now();
            self.events.push(SchedulerEvent::Interrupted {
                command: victim.clone(),
                interrupter: interrupter.clone(),
                at,
            });
            self.finish(
                root,
                RunOutcome::Canceled,
                Some(SchedulerEvent::Canceled {
                    command: victim,
                    at,
                }),
            );
        }
    }

    fn promote(&mut self, state: CommandState) {
        let id = state.id();
        for mechanism in state.command.footprint() {
            self.owners.insert(mechanism.id(), id);
        }
        self.running.insert(id, state);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal
    // ─────────────────────────────────────────────────────────────────────────

    /// Removes a running command and, before it, every descendant.
    ///
    /// `event` is recorded ahead of the descendants' cancellation events.
    fn finish(&mut self, id: CommandId, outcome: RunOutcome, event: Option<SchedulerEvent>) {
        if !self.is_running(id) {
            return;
        }
        if let Some(event) = event {
            self.events.push(event);
        }

        let children: Vec<Command> = self
            .running
            .values()
            .filter(|state| state.parent == Some(id))
            .map(|state| state.command.clone())
            .collect();
        for child in children {
            let at = self.now();
            let child_id = child.id();
            self.finish(
                child_id,
                RunOutcome::Canceled,
                Some(SchedulerEvent::Canceled {
                    command: child,
                    at,
                }),
            );
        }

        if let Some(state) = self.running.shift_remove(&id) {
            self.release(&state);
            self.settle(state, outcome);
        }
    }

    /// Hands each mechanism the run held back to the nearest running ancestor
    /// that requires it, or frees it.
    fn release(&mut self, state: &CommandState) {
        let id = state.id();
        for mechanism in state.command.footprint() {
            if self.owners.get(&mechanism.id()) != Some(&id) {
                continue;
            }
            match self.nearest_requiring(state.parent, mechanism) {
                Some(ancestor) => {
                    self.owners.insert(mechanism.id(), ancestor);
                }
                None => {
                    self.owners.remove(&mechanism.id());
                }
            }
        }
    }

    fn nearest_requiring(
        &self,
        mut cursor: Option<CommandId>,
        mechanism: &Mechanism,
    ) -> Option<CommandId> {
        while let Some(id) = cursor {
            let state = self.running.get(&id)?;
            if state.command.requires(mechanism) {
                return Some(id);
            }
            cursor = state.parent;
        }
        None
    }

    fn settle(&mut self, mut state: CommandState, outcome: RunOutcome) {
        if let Some(waiter) = state.waiter.take() {
            *waiter.lock() = Some(outcome);
        }
        self.retired.push(state);
    }

    pub(crate) fn cancel(&mut self, command: &Command) {
        let id = command.id();
        if let Some(state) = self.queued.shift_remove(&id) {
            tracing::debug!(command = %command, "Canceled queued command");
            self.settle(state, RunOutcome::Canceled);
            return;
        }
        if self.is_running(id) {
            tracing::debug!(command = %command, "Canceled running command");
            let at = self.now();
            self.finish(
                id,
                RunOutcome::Canceled,
                Some(SchedulerEvent::Canceled {
                    command: command.clone(),
                    at,
                }),
            );
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, state) in mem::take(&mut self.queued) {
            let at = self.now();
            self.events.push(SchedulerEvent::Canceled {
                command: state.command.clone(),
                at,
            });
            self.settle(state, RunOutcome::Canceled);
        }

        let ids: Vec<CommandId> = self.running.keys().copied().collect();
        for id in ids {
            if let Some(command) = self.running.get(&id).map(|state| state.command.clone()) {
                let at = self.now();
                self.finish(
                    id,
                    RunOutcome::Canceled,
                    Some(SchedulerEvent::Canceled { command, at }),
                );
            }
        }
        tracing::debug!("Canceled all commands");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resumption
    // ─────────────────────────────────────────────────────────────────────────

    /// Marks the tick finished. Clears the body stack, which is only
    /// non-empty here if a panic unwound out of the tick.
    pub(crate) fn end_tick(&mut self, elapsed: Duration) {
        self.in_tick = false;
        self.last_run_time = Some(elapsed);
        self.mounted.clear();
    }

    /// Advances the tick counter and returns the resumption order: newest
    /// first, so a parent resumes after the children it is waiting on.
    pub(crate) fn begin_commands(&mut self) -> Vec<CommandId> {
        self.tick += 1;
        self.running.keys().rev().copied().collect()
    }

    /// Takes the body out of a running command that has not been resumed
    /// during the current tick.
    pub(crate) fn mount(&mut self, id: CommandId) -> Option<(Command, RunId, BodyFuture)> {
        let tick = self.tick;
        let state = self.running.get_mut(&id)?;
        if state.last_resumed == Some(tick) {
            return None;
        }
        let future = state.future.take()?;
        state.last_resumed = Some(tick);
        let command = state.command.clone();
        let run_id = state.run_id;

        self.mounted.push(id);
        let at = self.now();
        self.events.push(SchedulerEvent::Mounted {
            command: command.clone(),
            at,
        });
        Some((command, run_id, future))
    }

    /// Records the result of one resumption.
    ///
    /// Returns an error only for a failing body nobody is waiting on.
    pub(crate) fn unmount(
        &mut self,
        command: &Command,
        run_id: RunId,
        future: BodyFuture,
        poll: Poll<CommandResult>,
        elapsed: Duration,
    ) -> Result<(), ExecutionError> {
        let id = command.id();
        if let Some(position) = self.mounted.iter().rposition(|mounted| *mounted == id) {
            self.mounted.remove(position);
        }

        let at = self.now();
        let Some(state) = self
            .running
            .get_mut(&id)
            .filter(|state| state.run_id == run_id)
        else {
            // Canceled while its body was on the stack.
            self.discarded.push(future);
            return Ok(());
        };
        state.last_runtime = elapsed;
        state.total_runtime += elapsed;

        match poll {
            Poll::Pending => {
                state.future = Some(future);
                tracing::trace!(command = %command, "Command yielded");
                self.events.push(SchedulerEvent::Yielded {
                    command: command.clone(),
                    at,
                });
                Ok(())
            }
            Poll::Ready(Ok(())) => {
                self.discarded.push(future);
                tracing::debug!(command = %command, "Command completed");
                self.finish(
                    id,
                    RunOutcome::Completed,
                    Some(SchedulerEvent::Completed {
                        command: command.clone(),
                        at,
                    }),
                );
                Ok(())
            }
            Poll::Ready(Err(error)) => {
                let awaited = state.waiter.is_some();
                self.discarded.push(future);
                tracing::warn!(command = %command, error = %error, "Command failed");
                let event = SchedulerEvent::CompletedWithError {
                    command: command.clone(),
                    error: error.to_string(),
                    at,
                };
                if awaited {
                    self.finish(id, RunOutcome::Failed(error), Some(event));
                    Ok(())
                } else {
                    self.finish(id, RunOutcome::Canceled, Some(event));
                    Err(ExecutionError::new(command.clone(), error))
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Default commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Stores a default command. Returns `true` if its mechanism is idle.
    pub(crate) fn set_default(&mut self, mechanism: &Mechanism, command: Command) -> bool {
        self.defaults
            .insert(mechanism.id(), (mechanism.clone(), command.clone()));
        self.is_idle_for(mechanism, &command)
    }

    fn is_idle_for(&self, mechanism: &Mechanism, command: &Command) -> bool {
        !self.contains(command.id())
            && command
                .footprint()
                .iter()
                .all(|m| !self.owners.contains_key(&m.id()))
            && !self
                .queued
                .values()
                .any(|queued| queued.command.requires(mechanism))
    }

    /// Default commands whose mechanism nothing holds or requests.
    pub(crate) fn idle_defaults(&self) -> Vec<Command> {
        self.defaults
            .values()
            .filter(|(mechanism, command)| self.is_idle_for(mechanism, command))
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// Puts a default command straight into the running set.
    pub(crate) fn start_default(&mut self, state: CommandState) {
        let command = state.command.clone();
        let free = !self.contains(command.id())
            && command
                .footprint()
                .iter()
                .all(|m| !self.owners.contains_key(&m.id()));
        if !free {
            self.retired.push(state);
            return;
        }

        tracing::debug!(command = %command, "Started default command");
        let at = self.now();
        self.events.push(SchedulerEvent::Scheduled { command, at });
        self.promote(state);
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
