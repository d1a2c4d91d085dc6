//! Integration tests for state machines built from commands.
//!
//! Tests are grouped by feature:
//! 1. **Setup**: initial state selection and errors
//! 2. **Transitions**: condition edges, completions, `switch_from_any`
//! 3. **Callbacks**: `on_enter` / `on_exit` ordering and visibility


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cadence_commands::prelude::*;
use parking_lot::Mutex;
use test_utils::{Counter, EventLog, entry, parked, tick};

/// Shared boolean flipped by the test and read by conditions.
#[derive(Clone, Default)]
struct Signal(Arc<AtomicBool>);

impl Signal {
    fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reader(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let flag = self.0.clone();
        move || flag.load(Ordering::SeqCst)
    }
}

/// A command that requires nothing and yields once before completing.
fn yield_once(name: &str) -> Command {
    Command::no_requirements()
        .executing(|co| async move {
            co.yield_now().await;
            Ok(())
        })
        .named(name)
}

/// A command that requires nothing and completes on its first resumption.
fn instant(name: &str) -> Command {
    Command::no_requirements().named(name)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SETUP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn missing_initial_state_fails_the_machine() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Mechanism", &scheduler);
    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&parked(Command::requiring([&mechanism]), "Command 1"));
    let two = machine.add_state(&parked(Command::requiring([&mechanism]), "Command 2"));
    one.switch_to(&two).unwrap().when_complete();

    scheduler.schedule(machine.command());
    let error = scheduler.run().unwrap_err();

    assert_eq!(error.command(), machine.command());
    assert_eq!(
        error.error().to_string(),
        "State Machine does not have an initial state. Use set_initial_state() to provide one."
    );
    assert!(!scheduler.is_running(machine.command()));
}

#[test]
fn initial_state_can_be_replaced() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Mechanism", &scheduler);
    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&parked(Command::requiring([&mechanism]), "Command 1"));
    let two = machine.add_state(&parked(Command::requiring([&mechanism]), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    machine.set_initial_state(&two).unwrap();
    two.switch_to(&one).unwrap().when_complete();

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);

    assert!(scheduler.is_running(machine.command()));
    assert!(scheduler.is_running(two.command()));
    assert!(!scheduler.is_running(one.command()));
}

/// The machine lends nothing; each state's command claims its own mechanisms.
#[test]
fn machine_requires_nothing() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Mechanism", &scheduler);
    let machine = StateMachine::new("State Machine");
    let only = machine.add_state(&parked(Command::requiring([&mechanism]), "Hold"));
    machine.set_initial_state(&only).unwrap();

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);

    assert!(machine.command().requirements().is_empty());
    assert_eq!(scheduler.holder_of(&mechanism), Some(only.command().clone()));
    assert_eq!(
        scheduler.parent_of(only.command()),
        Some(machine.command().clone())
    );

    scheduler.cancel(machine.command());
    assert!(!scheduler.is_running(only.command()));
    assert_eq!(scheduler.holder_of(&mechanism), None);
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSITIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn transitions_follow_their_conditions() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Mechanism", &scheduler);
    let (signal_a, signal_b) = (Signal::default(), Signal::default());

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&parked(Command::requiring([&mechanism]), "Command 1"));
    let two = machine.add_state(&parked(Command::requiring([&mechanism]), "Command 2"));
    let three = machine.add_state(&parked(Command::requiring([&mechanism]), "Command 3"));
    machine.set_initial_state(&one).unwrap();
    one.switch_to(&two).unwrap().when(signal_a.reader());
    two.switch_to(&three).unwrap().when(signal_b.reader());

    let running = |expected: [bool; 3]| {
        let actual = [&one, &two, &three].map(|state| scheduler.is_running(state.command()));
        assert_eq!(actual, expected);
        assert!(scheduler.is_running(machine.command()));
    };

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    running([true, false, false]);

    signal_a.set(true);
    tick(&scheduler, 1);
    running([false, true, false]);

    signal_b.set(true);
    tick(&scheduler, 1);
    running([false, false, true]);
}

#[test]
fn condition_already_true_switches_on_entry() {
    let scheduler = Scheduler::new();
    let signal = Signal::default();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&parked(Command::no_requirements(), "Command 1"));
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    one.switch_to(&two).unwrap().when(signal.reader());

    signal.set(true);
    scheduler.schedule(machine.command());
    tick(&scheduler, 1);

    assert!(scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(one.command()));
    assert!(scheduler.is_running(two.command()));
}

#[test]
fn completed_state_moves_on() {
    let scheduler = Scheduler::new();
    let signal = Signal::default();

    let ready = signal.clone();
    let wait = Command::no_requirements()
        .executing(move |co| {
            let ready = ready.clone();
            async move {
                co.wait_until(|| ready.get()).await;
                Ok(())
            }
        })
        .named("Command 1");

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&wait);
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    one.switch_to(&two).unwrap().when_complete();
    two.exit_state_machine().when_complete();

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(scheduler.is_running(one.command()));

    signal.set(true);
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(one.command()));
    assert!(scheduler.is_running(two.command()));
}

#[test]
fn state_switching_to_itself_restarts_its_command() {
    let scheduler = Scheduler::new();
    let log = EventLog::attach(&scheduler);
    let signal = Signal::default();
    let starts = Counter::new();

    let counter = starts.clone();
    let command = Command::no_requirements()
        .executing(move |co| {
            let counter = counter.clone();
            async move {
                counter.bump();
                co.park().await
            }
        })
        .named("Command");

    let machine = StateMachine::new("State Machine");
    let state = machine.add_state(&command);
    machine.set_initial_state(&state).unwrap();
    state.switch_to(&state).unwrap().when(signal.reader());

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert_eq!(starts.get(), 1);

    signal.set(true);
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert_eq!(starts.get(), 2);

    // Still true: the edge has passed, so no further restarts.
    tick(&scheduler, 3);
    assert_eq!(starts.get(), 2);

    let machine_name = "State Machine";
    assert_eq!(
        log.entries()[..14],
        [
            // First tick
            entry("scheduled", machine_name),
            entry("mounted", machine_name),
            entry("scheduled", "Command"),
            entry("mounted", "Command"),
            entry("yielded", "Command"),
            entry("yielded", machine_name),
            // Second tick: the child resumes first, then the machine restarts it
            entry("mounted", "Command"),
            entry("yielded", "Command"),
            entry("mounted", machine_name),
            entry("canceled", "Command"),
            entry("scheduled", "Command"),
            entry("mounted", "Command"),
            entry("yielded", "Command"),
            entry("yielded", machine_name),
        ]
    );
}

#[test]
fn one_shot_state_switching_to_itself_runs_once_per_tick() {
    let scheduler = Scheduler::new();
    let runs = Counter::new();

    let counter = runs.clone();
    let command = Command::no_requirements()
        .executing(move |_co| {
            let counter = counter.clone();
            async move {
                counter.bump();
                Ok(())
            }
        })
        .named("Command");

    let machine = StateMachine::new("State Machine");
    let state = machine.add_state(&command);
    machine.set_initial_state(&state).unwrap();
    state.switch_to(&state).unwrap().when_complete();

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert_eq!(runs.get(), 1);

    tick(&scheduler, 4);
    assert_eq!(runs.get(), 5);
}

#[test]
fn completions_are_checked_when_the_state_finishes() {
    let scheduler = Scheduler::new();
    let signal = Signal::default();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&yield_once("Command 1"));
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    one.exit_state_machine().when_complete();
    one.switch_to(&two).unwrap().when_complete_and(signal.reader());

    // Signal low: the machine exits once the state completes.
    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(scheduler.is_running(one.command()));
    tick(&scheduler, 1);
    assert!(!scheduler.is_running(machine.command()));

    // Signal high: the same completion now moves to the second state.
    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(scheduler.is_running(one.command()));

    signal.set(true);
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(one.command()));
    assert!(scheduler.is_running(two.command()));
}

#[test]
fn first_matching_completion_wins() {
    let scheduler = Scheduler::new();
    let abort = Signal::default();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&instant("Command 1"));
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    one.exit_state_machine().when_complete_and(abort.reader());
    one.switch_to(&two).unwrap().when_complete();

    abort.set(true);
    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(!scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(two.command()));

    abort.set(false);
    scheduler.schedule(machine.command());
    tick(&scheduler, 2);
    assert!(scheduler.is_running(two.command()));
}

#[test]
fn switch_from_any_applies_to_every_listed_state() {
    let scheduler = Scheduler::new();
    let signal = Signal::default();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&yield_once("Command 1"));
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    let three = machine.add_state(&parked(Command::no_requirements(), "Command 3"));
    machine.set_initial_state(&one).unwrap();
    machine
        .switch_from_any(&[one.clone(), two.clone()])
        .unwrap()
        .to(&three)
        .unwrap()
        .when(signal.reader());
    one.switch_to(&two).unwrap().when_complete();

    // From the first state
    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(scheduler.is_running(one.command()));

    signal.set(true);
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(one.command()));
    assert!(scheduler.is_running(three.command()));

    scheduler.cancel(machine.command());
    assert!(!scheduler.is_running(three.command()));
    signal.set(false);

    // From the second state
    scheduler.schedule(machine.command());
    tick(&scheduler, 2);
    assert!(scheduler.is_running(machine.command()));
    assert!(scheduler.is_running(two.command()));

    signal.set(true);
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(two.command()));
    assert!(scheduler.is_running(three.command()));
}

#[test]
fn exit_transition_ends_the_machine() {
    let scheduler = Scheduler::new();
    let signal = Signal::default();

    let machine = StateMachine::new("State Machine");
    let only = machine.add_state(&parked(Command::no_requirements(), "Command"));
    machine.set_initial_state(&only).unwrap();
    only.exit_state_machine().when(signal.reader());

    scheduler.schedule(machine.command());
    tick(&scheduler, 2);
    assert!(scheduler.is_running(only.command()));

    signal.set(true);
    tick(&scheduler, 1);
    assert!(!scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(only.command()));
}

// ═══════════════════════════════════════════════════════════════════════════════
// CALLBACKS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn on_enter_runs_for_the_initial_state() {
    let scheduler = Scheduler::new();
    let entered = Counter::new();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&parked(Command::no_requirements(), "Command 1"));
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    let counter = entered.clone();
    one.on_enter(move || {
        counter.bump();
    });
    one.switch_to(&two).unwrap().when_complete();

    scheduler.schedule(machine.command());
    tick(&scheduler, 3);
    assert_eq!(entered.get(), 1);
}

#[test]
fn on_exit_runs_on_transition() {
    let scheduler = Scheduler::new();
    let exited = Counter::new();
    let signal = Signal::default();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&parked(Command::no_requirements(), "Command 1"));
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    let counter = exited.clone();
    one.on_exit(move || {
        counter.bump();
    });
    one.switch_to(&two).unwrap().when(signal.reader());

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert_eq!(exited.get(), 0);

    signal.set(true);
    tick(&scheduler, 1);
    assert_eq!(exited.get(), 1);
}

#[test]
fn on_exit_runs_when_the_state_completes() {
    let scheduler = Scheduler::new();
    let exited = Counter::new();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&instant("Command 1"));
    machine.set_initial_state(&one).unwrap();
    let counter = exited.clone();
    one.on_exit(move || {
        counter.bump();
    });

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert_eq!(exited.get(), 1);
    assert!(!scheduler.is_running(one.command()));
    assert!(!scheduler.is_running(machine.command()));
}

/// A command scheduled from `on_exit` becomes a child of the machine and
/// takes the mechanism from the state being left.
#[test]
fn on_exit_can_schedule() {
    let scheduler = Scheduler::new();
    let mechanism = Mechanism::new("Mechanism", &scheduler);
    let main = parked(Command::requiring([&mechanism]), "Main Mech Command");
    let background = parked(Command::requiring([&mechanism]), "Background Mech Command");
    let next = parked(Command::no_requirements(), "Next");
    let signal = Signal::default();

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&main);
    let two = machine.add_state(&next);
    machine.set_initial_state(&one).unwrap();
    one.switch_to(&two).unwrap().when(signal.reader());
    let (handle, command) = (scheduler.clone(), background.clone());
    one.on_exit(move || {
        handle.schedule(&command);
    });

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(scheduler.is_running(&main));

    signal.set(true);
    tick(&scheduler, 1);
    assert!(scheduler.is_running(machine.command()));
    assert!(!scheduler.is_running(&main));
    assert!(scheduler.is_running(&background));
    assert!(scheduler.is_running(&next));
    assert_eq!(scheduler.holder_of(&mechanism), Some(background.clone()));
}

#[test]
fn callbacks_run_in_insertion_order() {
    let scheduler = Scheduler::new();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let machine = StateMachine::new("State Machine");
    let one = machine.add_state(&instant("Command 1"));
    machine.set_initial_state(&one).unwrap();
    for label in ["exit 1", "exit 2"] {
        let calls = calls.clone();
        one.on_exit(move || calls.lock().push(label));
    }
    for label in ["enter 1", "enter 2"] {
        let calls = calls.clone();
        one.on_enter(move || calls.lock().push(label));
    }

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert_eq!(*calls.lock(), ["enter 1", "enter 2", "exit 1", "exit 2"]);
}

#[test]
fn on_enter_sees_the_new_command() {
    let scheduler = Scheduler::new();
    let saw_running = Signal::default();

    let machine = StateMachine::new("State Machine");
    let command = parked(Command::no_requirements(), "Command 1");
    let one = machine.add_state(&command);
    machine.set_initial_state(&one).unwrap();
    let (observer, flag) = (scheduler.clone(), saw_running.clone());
    one.on_enter(move || flag.set(observer.is_running(&command)));

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(saw_running.get());
}

#[test]
fn on_exit_on_transition_sees_the_exiting_command() {
    let scheduler = Scheduler::new();
    let saw_running = Signal::default();
    let signal = Signal::default();

    let machine = StateMachine::new("State Machine");
    let command = parked(Command::no_requirements(), "Command 1");
    let one = machine.add_state(&command);
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    let (observer, flag) = (scheduler.clone(), saw_running.clone());
    one.on_exit(move || flag.set(observer.is_running(&command)));
    one.switch_to(&two).unwrap().when(signal.reader());

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    signal.set(true);
    tick(&scheduler, 1);
    assert!(saw_running.get());
}

/// Completion means the command already finished, so `on_exit` can never
/// see it running.
#[test]
fn on_exit_after_completion_cannot_see_the_command() {
    let scheduler = Scheduler::new();
    let exited = Signal::default();
    let saw_running = Signal::default();

    let machine = StateMachine::new("State Machine");
    let command = yield_once("Command 1");
    let one = machine.add_state(&command);
    let two = machine.add_state(&parked(Command::no_requirements(), "Command 2"));
    machine.set_initial_state(&one).unwrap();
    let (observer, called, flag) = (scheduler.clone(), exited.clone(), saw_running.clone());
    one.on_exit(move || {
        called.set(true);
        flag.set(observer.is_running(&command));
    });
    one.switch_to(&two).unwrap().when_complete();

    scheduler.schedule(machine.command());
    tick(&scheduler, 1);
    assert!(!exited.get());

    tick(&scheduler, 1);
    assert!(exited.get());
    assert!(!saw_running.get());
}
