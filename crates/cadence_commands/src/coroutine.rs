//! The suspension handle passed into command bodies.
//!
//! A body only gives up control at an `.await` on one of the [`Coroutine`]
//! methods. Code between two such points runs without interruption from any
//! other command.
//!
//! # Example
//!
//! ```
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let arm = Mechanism::new("Arm", &scheduler);
//! let wrist = Mechanism::new("Wrist", &scheduler);
//!
//! let stow_arm = arm.run(|co| async move { co.yield_now().await; Ok(()) }).named("Stow Arm");
//! let stow_wrist = wrist.run(|_co| async move { Ok(()) }).named("Stow Wrist");
//!
//! let stow = Command::no_requirements()
//!     .executing(move |co| {
//!         let (arm, wrist) = (stow_arm.clone(), stow_wrist.clone());
//!         async move {
//!             co.await_all(&[arm, wrist]).await?;
//!             co.park().await
//!         }
//!     })
//!     .named("Stow");
//!
//! scheduler.schedule(&stow);
//! scheduler.run()?;
//! assert_eq!(scheduler.running_commands().len(), 2);
//! # Ok::<(), ExecutionError>(())
//! ```

use core::fmt;
use core::task::Poll;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::{Command, CommandResult};
use crate::error::CommandError;
use crate::scheduler::{CompletionSlot, RunId, RunOutcome, ScheduleResult, Scheduler, Shared};

/// Handle through which a running body suspends and composes other commands.
///
/// Each run of a command gets its own coroutine. The handle holds the
/// scheduler weakly, so a body that outlives its scheduler simply observes
/// that it is no longer running.
#[derive(Clone)]
pub struct Coroutine {
    shared: Weak<Shared>,
    command: Command,
    /// `None` for sideloads, which are never canceled.
    run_id: Option<RunId>,
}

impl Coroutine {
    pub(crate) fn for_command(shared: Weak<Shared>, command: Command, run_id: RunId) -> Self {
        Self {
            shared,
            command,
            run_id: Some(run_id),
        }
    }

    pub(crate) fn for_sideload(shared: Weak<Shared>, command: Command) -> Self {
        Self {
            shared,
            command,
            run_id: None,
        }
    }

    /// Returns the scheduler driving this coroutine, if it still exists.
    #[must_use]
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.shared.upgrade().map(Scheduler::from_shared)
    }

    /// Returns the command this coroutine belongs to.
    ///
    /// Sideloads report a synthetic command named `sideload`.
    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Returns `true` while this run of the command is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        let Some(scheduler) = self.scheduler() else {
            return false;
        };
        match self.run_id {
            Some(run_id) => scheduler.is_live(self.command.id(), run_id),
            None => true,
        }
    }

    /// Suspends until the next tick.
    ///
    /// Returns `false` without suspending if the command has been canceled or
    /// interrupted since it was last resumed, so the body can wind down.
    /// Otherwise returns `true` once resumed.
    pub async fn yield_now(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        suspend().await;
        self.is_running()
    }

    /// Suspends forever.
    ///
    /// The command keeps its mechanisms until something cancels or
    /// interrupts it.
    pub async fn park(&self) -> CommandResult {
        std::future::pending().await
    }

    /// Starts a child command without waiting for it.
    ///
    /// The child begins executing immediately, before `fork` returns, and is
    /// canceled when this command ends. Forked from a sideload, the command
    /// is queued instead and is not a child of anything.
    pub fn fork(&self, command: &Command) -> ScheduleResult {
        self.start(command, None)
    }

    fn start(&self, command: &Command, waiter: Option<CompletionSlot>) -> ScheduleResult {
        let Some(scheduler) = self.scheduler() else {
            return ScheduleResult::ParentNotRunning;
        };
        let parent = self.run_id.map(|_| self.command.id());
        scheduler.submit(command, parent, waiter)
    }

    /// Starts a child command and suspends until it has finished.
    ///
    /// If the command is already queued or running, waits for that run to
    /// end instead. Returns immediately if the child could not start.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Child`] if the child's body failed.
    pub async fn schedule_and_wait(&self, command: &Command) -> CommandResult {
        let slot: CompletionSlot = Arc::new(Mutex::new(None));
        match self.start(command, Some(slot.clone())) {
            ScheduleResult::Scheduled => loop {
                let outcome = slot.lock().take();
                if let Some(outcome) = outcome {
                    return child_result(command, outcome);
                }
                if !self.yield_now().await {
                    return Ok(());
                }
            },
            ScheduleResult::AlreadyScheduled => {
                while self.is_scheduled_or_running(command) {
                    if !self.yield_now().await {
                        break;
                    }
                }
                Ok(())
            }
            ScheduleResult::LowerPriority | ScheduleResult::ParentNotRunning => Ok(()),
        }
    }

    /// Starts every command as a child and waits until all have finished.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::ConflictingRequirements`] without starting
    /// anything if two of the commands share a mechanism, or
    /// [`CommandError::Child`] as soon as one of them fails.
    pub async fn await_all(&self, commands: &[Command]) -> CommandResult {
        check_parallel(commands)?;
        let mut pending = self.start_all(commands);

        loop {
            let mut index = 0;
            while index < pending.len() {
                let (command, slot) = &pending[index];
                match self.poll_child(command, slot.as_ref()) {
                    Some(Err(error)) => return Err(error),
                    Some(Ok(())) => {
                        pending.swap_remove(index);
                    }
                    None => index += 1,
                }
            }
            if pending.is_empty() || !self.yield_now().await {
                return Ok(());
            }
        }
    }

    /// Starts every command as a child and waits until one of them finishes,
    /// then cancels the rest.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::ConflictingRequirements`] without starting
    /// anything if two of the commands share a mechanism, or the
    /// [`CommandError::Child`] of the first command to finish, if it failed.
    pub async fn await_any(&self, commands: &[Command]) -> CommandResult {
        if commands.is_empty() {
            return Ok(());
        }
        check_parallel(commands)?;
        let pending = self.start_all(commands);

        loop {
            let finished = pending
                .iter()
                .find_map(|(command, slot)| self.poll_child(command, slot.as_ref()));
            if let Some(result) = finished {
                if let Some(scheduler) = self.scheduler() {
                    for (command, _) in &pending {
                        scheduler.cancel(command);
                    }
                }
                return result;
            }
            if !self.yield_now().await {
                return Ok(());
            }
        }
    }

    fn start_all(&self, commands: &[Command]) -> Vec<(Command, Option<CompletionSlot>)> {
        commands
            .iter()
            .map(|command| {
                let slot: CompletionSlot = Arc::new(Mutex::new(None));
                match self.start(command, Some(slot.clone())) {
                    ScheduleResult::Scheduled => (command.clone(), Some(slot)),
                    _ => (command.clone(), None),
                }
            })
            .collect()
    }

    /// Returns the child's result once it is no longer running.
    fn poll_child(&self, command: &Command, slot: Option<&CompletionSlot>) -> Option<CommandResult> {
        match slot {
            Some(slot) => {
                let outcome = slot.lock().take();
                outcome.map(|outcome| child_result(command, outcome))
            }
            None => (!self.is_scheduled_or_running(command)).then_some(Ok(())),
        }
    }

    fn is_scheduled_or_running(&self, command: &Command) -> bool {
        self.scheduler()
            .is_some_and(|scheduler| scheduler.is_scheduled_or_running(command))
    }

    /// Suspends until at least `duration` has passed on the scheduler clock.
    ///
    /// Returns `false` early if the command stops running.
    pub async fn wait(&self, duration: Duration) -> bool {
        let Some(timer) = self.shared.upgrade().map(|shared| shared.clock().timer(duration)) else {
            return false;
        };
        loop {
            let expired = self
                .shared
                .upgrade()
                .map(|shared| timer.has_elapsed(shared.clock()));
            match expired {
                Some(true) => return true,
                Some(false) => {}
                None => return false,
            }
            if !self.yield_now().await {
                return false;
            }
        }
    }

    /// Suspends until `condition` returns `true`, checking once per tick.
    ///
    /// The condition is checked before the first suspension. Returns `false`
    /// early if the command stops running.
    pub async fn wait_until<F>(&self, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        loop {
            if condition() {
                return true;
            }
            if !self.yield_now().await {
                return false;
            }
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("command", &self.command.name())
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Returns `Pending` exactly once.
fn suspend() -> impl Future<Output = ()> {
    let mut suspended = false;
    futures::future::poll_fn(move |_cx| {
        if suspended {
            Poll::Ready(())
        } else {
            suspended = true;
            Poll::Pending
        }
    })
}

fn child_result(command: &Command, outcome: RunOutcome) -> CommandResult {
    match outcome {
        RunOutcome::Completed | RunOutcome::Canceled => Ok(()),
        RunOutcome::Failed(error) => Err(CommandError::Child {
            name: command.name().to_owned(),
            source: Box::new(error),
        }),
    }
}

/// Rejects command sets that could not all hold their mechanisms at once.
fn check_parallel(commands: &[Command]) -> CommandResult {
    for (index, first) in commands.iter().enumerate() {
        for second in &commands[index + 1..] {
            if let Some(mechanism) = first.footprint().iter().find(|m| second.requires(m)) {
                return Err(CommandError::ConflictingRequirements {
                    first: first.name().to_owned(),
                    second: second.name().to_owned(),
                    mechanism: mechanism.name().to_owned(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::mechanism::Mechanism;
    use crate::time::MockClock;

    fn mock_scheduler() -> (Scheduler, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let scheduler = Scheduler::builder().with_clock(clock.clone()).build();
        (scheduler, clock)
    }

    #[test]
    fn short_wait_completes_once_elapsed() {
        let (scheduler, clock) = mock_scheduler();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        let command = Command::no_requirements()
            .executing(move |co| {
                let flag = flag.clone();
                async move {
                    co.wait(Duration::from_millis(1)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .named("Short Wait");

        scheduler.schedule(&command);
        scheduler.run().unwrap();
        assert!(!done.load(Ordering::SeqCst));

        clock.advance(Duration::from_secs(1));
        scheduler.run().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_spans_several_ticks() {
        let (scheduler, clock) = mock_scheduler();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        let command = Command::no_requirements()
            .executing(move |co| {
                let flag = flag.clone();
                async move {
                    co.wait(Duration::from_millis(1)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .named("Short Wait");

        scheduler.schedule(&command);
        scheduler.run().unwrap();

        clock.advance(Duration::from_micros(500));
        scheduler.run().unwrap();
        assert!(!done.load(Ordering::SeqCst), "only half the wait has elapsed");

        clock.advance(Duration::from_micros(500));
        scheduler.run().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn zero_wait_does_not_suspend() {
        let (scheduler, _clock) = mock_scheduler();
        let command = Command::no_requirements()
            .executing(|co| async move {
                assert!(co.wait(Duration::ZERO).await);
                Ok(())
            })
            .named("No Wait");

        scheduler.schedule(&command);
        scheduler.run().unwrap();
        assert!(!scheduler.is_scheduled_or_running(&command));
    }

    #[test]
    fn wait_until_checks_before_suspending() {
        let scheduler = Scheduler::new();
        let gate = Arc::new(AtomicBool::new(false));

        let open = gate.clone();
        let command = Command::no_requirements()
            .executing(move |co| {
                let open = open.clone();
                async move {
                    co.wait_until(|| open.load(Ordering::SeqCst)).await;
                    Ok(())
                }
            })
            .named("Gate");

        scheduler.schedule(&command);
        scheduler.run().unwrap();
        assert!(scheduler.is_running(&command));

        gate.store(true, Ordering::SeqCst);
        scheduler.run().unwrap();
        assert!(!scheduler.is_running(&command));
    }

    #[test]
    fn yield_after_cancel_returns_false_without_suspending() {
        let scheduler = Scheduler::new();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let log = observed.clone();
        let command = Command::no_requirements()
            .executing(move |co| {
                let log = log.clone();
                async move {
                    if let Some(scheduler) = co.scheduler() {
                        scheduler.cancel(co.command());
                    }
                    let resumed = co.yield_now().await;
                    log.lock().push(resumed);
                    log.lock().push(co.is_running());
                    Ok(())
                }
            })
            .named("Self Cancel");

        scheduler.schedule(&command);
        scheduler.run().unwrap();

        assert_eq!(*observed.lock(), vec![false, false]);
        assert!(!scheduler.is_running(&command));
    }

    #[test]
    fn conflicting_parallel_commands_are_rejected() {
        let scheduler = Scheduler::new();
        let mechanism = Mechanism::new("The Mechanism", &scheduler);
        let first = mechanism.idle();
        let second = Command::requiring([&mechanism]).named("Second");

        let error = check_parallel(&[first.clone(), second]).unwrap_err();
        assert_eq!(
            error.to_string(),
            format!(
                "Commands running in parallel cannot share requirements: \
                 {} and Second both require The Mechanism",
                first.name()
            )
        );
    }

    #[test]
    fn coroutine_outliving_scheduler_reports_not_running() {
        let scheduler = Scheduler::new();
        let command = Command::no_requirements().named("Orphan");
        let co = Coroutine::for_command(scheduler.downgrade(), command.clone(), RunId(1));
        drop(scheduler);

        assert!(co.scheduler().is_none());
        assert!(!co.is_running());
        assert_eq!(co.fork(&command), ScheduleResult::ParentNotRunning);
    }
}
