//! A command that moves through a graph of states.
//!
//! Each [`State`] wraps a command. The machine forks the current state's
//! command as a child and watches its transitions once per tick:
//!
//! - [`when`](TransitionCondition::when) switches as soon as the condition
//!   becomes true, canceling the state's command.
//! - [`when_complete`](TransitionCondition::when_complete) and
//!   [`when_complete_and`](TransitionCondition::when_complete_and) pick the
//!   next state after the command finishes on its own.
//!
//! A state whose command finishes without a matching completion exits the
//! machine. The machine itself requires nothing; the state commands claim
//! their own mechanisms.
//!
//! Conditions fire on their rising edge only, so a state that switches to
//! itself restarts once per change rather than every tick. Edge memory is
//! kept per run of the machine and shared by the states of a
//! [`switch_from_any`](StateMachine::switch_from_any) transition.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use cadence_commands::prelude::*;
//!
//! let scheduler = Scheduler::new();
//! let arm = Mechanism::new("Arm", &scheduler);
//! let loaded = Arc::new(AtomicBool::new(false));
//!
//! let machine = StateMachine::new("Intake Cycle");
//! let wait = machine.add_state(&arm.run(|co| async move { co.park().await }).named("Wait"));
//! let stow = machine.add_state(&arm.run(|co| async move { co.park().await }).named("Stow"));
//! machine.set_initial_state(&wait)?;
//!
//! let sensor = loaded.clone();
//! wait.switch_to(&stow)?.when(move || sensor.load(Ordering::SeqCst));
//!
//! scheduler.schedule(machine.command());
//! scheduler.run()?;
//! assert!(scheduler.is_running(wait.command()));
//!
//! loaded.store(true, Ordering::SeqCst);
//! scheduler.run()?;
//! assert!(scheduler.is_running(stow.command()));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use core::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::command::{Command, CommandResult};
use crate::coroutine::Coroutine;
use crate::error::{CommandError, StateMachineError};

type Condition = Arc<dyn Fn() -> bool + Send + Sync>;
type Callback = Arc<dyn Fn() + Send + Sync>;
type SharedGraph = Arc<Mutex<Graph>>;

struct Graph {
    name: String,
    initial: Option<usize>,
    states: Vec<StateNode>,
    transitions: Vec<Transition>,
}

#[derive(Clone)]
struct StateNode {
    command: Command,
    transitions: Vec<usize>,
    completions: Vec<Completion>,
    on_enter: Vec<Callback>,
    on_exit: Vec<Callback>,
}

#[derive(Clone)]
struct Transition {
    /// `None` exits the machine.
    target: Option<usize>,
    condition: Condition,
}

#[derive(Clone)]
struct Completion {
    target: Option<usize>,
    condition: Condition,
}

/// A state as seen for one visit: its command and outgoing edges.
struct Visit {
    command: Command,
    transitions: Vec<(usize, Transition)>,
    completions: Vec<Completion>,
    on_enter: Vec<Callback>,
    on_exit: Vec<Callback>,
}

impl Graph {
    fn visit(&self, index: usize) -> Option<Visit> {
        let node = self.states.get(index)?.clone();
        let transitions = node
            .transitions
            .iter()
            .filter_map(|&id| self.transitions.get(id).map(|t| (id, t.clone())))
            .collect();
        Some(Visit {
            command: node.command,
            transitions,
            completions: node.completions,
            on_enter: node.on_enter,
            on_exit: node.on_exit,
        })
    }

    fn add_transition(&mut self, from: &[usize], transition: Transition) {
        let id = self.transitions.len();
        self.transitions.push(transition);
        for &index in from {
            if let Some(node) = self.states.get_mut(index) {
                node.transitions.push(id);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StateMachine
// ─────────────────────────────────────────────────────────────────────────────

/// A command that runs one of its states at a time.
///
/// States and transitions may be added after the machine's command is
/// created; each run reads the graph as it is when a state is entered.
pub struct StateMachine {
    graph: SharedGraph,
    command: Command,
}

impl StateMachine {
    /// Creates an empty machine.
    ///
    /// Running it fails until [`set_initial_state`](Self::set_initial_state)
    /// has been called.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let graph: SharedGraph = Arc::new(Mutex::new(Graph {
            name: name.clone(),
            initial: None,
            states: Vec::new(),
            transitions: Vec::new(),
        }));

        let body_graph = graph.clone();
        let command = Command::no_requirements()
            .executing(move |co| run(co, body_graph.clone()))
            .named(name);
        Self { graph, command }
    }

    /// Returns the command that runs the machine.
    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Returns the machine's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Adds a state that runs `command`.
    #[must_use]
    pub fn add_state(&self, command: &Command) -> State {
        let mut graph = self.graph.lock();
        graph.states.push(StateNode {
            command: command.clone(),
            transitions: Vec::new(),
            completions: Vec::new(),
            on_enter: Vec::new(),
            on_exit: Vec::new(),
        });
        State {
            graph: self.graph.clone(),
            index: graph.states.len() - 1,
            command: command.clone(),
        }
    }

    /// Sets the state every run starts in, replacing any earlier choice.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError::ForeignState`] if the state was added to
    /// another machine.
    pub fn set_initial_state(&self, state: &State) -> Result<(), StateMachineError> {
        self.check(state)?;
        self.graph.lock().initial = Some(state.index);
        Ok(())
    }

    /// Starts a transition out of each of `states`, or out of every state
    /// added so far if `states` is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError::ForeignState`] if any state was added to
    /// another machine.
    pub fn switch_from_any(&self, states: &[State]) -> Result<TransitionTarget, StateMachineError> {
        let from = if states.is_empty() {
            (0..self.graph.lock().states.len()).collect()
        } else {
            states
                .iter()
                .map(|state| self.check(state).map(|()| state.index))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(TransitionTarget {
            graph: self.graph.clone(),
            from,
        })
    }

    fn check(&self, state: &State) -> Result<(), StateMachineError> {
        if Arc::ptr_eq(&self.graph, &state.graph) {
            Ok(())
        } else {
            Err(StateMachineError::ForeignState {
                machine: self.name().to_owned(),
                state: state.command.name().to_owned(),
            })
        }
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.graph.lock();
        f.debug_struct("StateMachine")
            .field("name", &graph.name)
            .field("states", &graph.states.len())
            .field("initial", &graph.initial)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to one state of a [`StateMachine`].
#[derive(Clone)]
pub struct State {
    graph: SharedGraph,
    index: usize,
    command: Command,
}

impl State {
    /// Returns the command this state runs.
    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Adds a callback that runs each time the state is entered, right after
    /// its command has started.
    pub fn on_enter<F>(&self, callback: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Some(node) = self.graph.lock().states.get_mut(self.index) {
            node.on_enter.push(Arc::new(callback));
        }
        self
    }

    /// Adds a callback that runs each time the state is left.
    ///
    /// On a [`when`](TransitionCondition::when) transition it runs before the
    /// command is canceled; on completion it runs after the command has
    /// finished.
    pub fn on_exit<F>(&self, callback: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Some(node) = self.graph.lock().states.get_mut(self.index) {
            node.on_exit.push(Arc::new(callback));
        }
        self
    }

    /// Starts a transition from this state to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError::ForeignState`] if `target` belongs to a
    /// different machine.
    pub fn switch_to(&self, target: &State) -> Result<TransitionCondition, StateMachineError> {
        TransitionTarget {
            graph: self.graph.clone(),
            from: vec![self.index],
        }
        .to(target)
    }

    /// Starts a transition from this state out of the machine.
    pub fn exit_state_machine(&self) -> TransitionCondition {
        TransitionCondition {
            graph: self.graph.clone(),
            from: vec![self.index],
            target: None,
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("index", &self.index)
            .field("command", &self.command.name())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transition builders
// ─────────────────────────────────────────────────────────────────────────────

/// A transition that still needs a target.
#[must_use = "use `.to()` or `.to_exit()` to pick the target"]
pub struct TransitionTarget {
    graph: SharedGraph,
    from: Vec<usize>,
}

impl TransitionTarget {
    /// Targets another state of the same machine.
    ///
    /// # Errors
    ///
    /// Returns [`StateMachineError::ForeignState`] if `target` belongs to a
    /// different machine.
    pub fn to(self, target: &State) -> Result<TransitionCondition, StateMachineError> {
        if !Arc::ptr_eq(&self.graph, &target.graph) {
            return Err(StateMachineError::ForeignState {
                machine: self.graph.lock().name.clone(),
                state: target.command.name().to_owned(),
            });
        }
        Ok(TransitionCondition {
            graph: self.graph,
            from: self.from,
            target: Some(target.index),
        })
    }

    /// Targets the end of the machine.
    pub fn to_exit(self) -> TransitionCondition {
        TransitionCondition {
            graph: self.graph,
            from: self.from,
            target: None,
        }
    }
}

/// A transition that still needs a condition.
#[must_use = "use `.when()`, `.when_complete()` or `.when_complete_and()`"]
pub struct TransitionCondition {
    graph: SharedGraph,
    from: Vec<usize>,
    target: Option<usize>,
}

impl TransitionCondition {
    /// Switches while the state's command is still running, once
    /// `condition` becomes true.
    pub fn when<F>(self, condition: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let transition = Transition {
            target: self.target,
            condition: Arc::new(condition),
        };
        self.graph.lock().add_transition(&self.from, transition);
    }

    /// Switches after the state's command finishes on its own.
    ///
    /// Exiting is already what happens to a completed state without a
    /// matching completion, so this does nothing for an exit target.
    pub fn when_complete(self) {
        if self.target.is_none() {
            return;
        }
        self.when_complete_and(|| true);
    }

    /// Switches after the state's command finishes on its own, if
    /// `condition` holds at that moment.
    ///
    /// Completions are checked in the order they were added.
    pub fn when_complete_and<F>(self, condition: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let condition: Condition = Arc::new(condition);
        let mut graph = self.graph.lock();
        for &index in &self.from {
            if let Some(node) = graph.states.get_mut(index) {
                node.completions.push(Completion {
                    target: self.target,
                    condition: condition.clone(),
                });
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution
// ─────────────────────────────────────────────────────────────────────────────

/// Rising-edge detection for every transition seen during one run.
#[derive(Default)]
struct Edges {
    previous: HashMap<usize, bool>,
}

impl Edges {
    fn rising(&mut self, id: usize, value: bool) -> bool {
        let previous = self.previous.insert(id, value).unwrap_or(false);
        value && !previous
    }
}

async fn run(co: Coroutine, graph: SharedGraph) -> CommandResult {
    let (name, initial) = {
        let graph = graph.lock();
        (graph.name.clone(), graph.initial)
    };
    let Some(initial) = initial else {
        return Err(CommandError::failed(format!(
            "{name} does not have an initial state. Use set_initial_state() to provide one."
        )));
    };

    let mut edges = Edges::default();
    let mut current = Some(initial);

    while let Some(index) = current {
        let visit = graph.lock().visit(index);
        let Some(visit) = visit else {
            break;
        };
        tracing::debug!(machine = %name, state = %visit.command, "Entering state");

        co.fork(&visit.command);
        visit.on_enter.iter().for_each(|callback| callback());

        let mut yielded = false;
        let mut switched = None;
        while is_running(&co, &visit.command) {
            switched = visit
                .transitions
                .iter()
                .find(|(id, transition)| edges.rising(*id, (transition.condition)()))
                .map(|(_, transition)| transition.target);
            if switched.is_some() {
                break;
            }
            if !co.yield_now().await {
                return Ok(());
            }
            yielded = true;
        }

        visit.on_exit.iter().for_each(|callback| callback());
        match switched {
            Some(target) => {
                if let Some(scheduler) = co.scheduler() {
                    scheduler.cancel(&visit.command);
                }
                current = target;
            }
            None => {
                current = visit
                    .completions
                    .iter()
                    .find(|completion| (completion.condition)())
                    .and_then(|completion| completion.target);
                // One-shot states still cost a tick each.
                if !yielded && current.is_some() && !co.yield_now().await {
                    return Ok(());
                }
            }
        }
    }

    tracing::debug!(machine = %name, "State machine exited");
    Ok(())
}

fn is_running(co: &Coroutine, command: &Command) -> bool {
    co.scheduler()
        .is_some_and(|scheduler| scheduler.is_running(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_fire_once_per_rise() {
        let mut edges = Edges::default();
        assert!(edges.rising(0, true));
        assert!(!edges.rising(0, true));
        assert!(!edges.rising(0, false));
        assert!(edges.rising(0, true));
        assert!(!edges.rising(1, false));
    }

    #[test]
    fn foreign_states_are_rejected() {
        let first = StateMachine::new("First");
        let second = StateMachine::new("Second");
        let ours = first.add_state(&Command::no_requirements().named("Ours"));
        let theirs = second.add_state(&Command::no_requirements().named("Theirs"));

        let expected = StateMachineError::ForeignState {
            machine: "First".into(),
            state: "Theirs".into(),
        };
        assert_eq!(first.set_initial_state(&theirs), Err(expected.clone()));
        assert!(matches!(ours.switch_to(&theirs), Err(e) if e == expected));
        assert!(matches!(first.switch_from_any(&[theirs.clone()]), Err(e) if e == expected));
        assert!(first.set_initial_state(&ours).is_ok());
    }

    #[test]
    fn switch_from_any_without_states_covers_every_state() {
        let machine = StateMachine::new("Machine");
        let a = machine.add_state(&Command::no_requirements().named("A"));
        let b = machine.add_state(&Command::no_requirements().named("B"));
        machine
            .switch_from_any(&[])
            .unwrap()
            .to(&a)
            .unwrap()
            .when(|| false);

        let graph = machine.graph.lock();
        assert_eq!(graph.transitions.len(), 1);
        assert_eq!(graph.states[a.index].transitions, vec![0]);
        assert_eq!(graph.states[b.index].transitions, vec![0]);
    }

    #[test]
    fn exit_completion_is_ignored() {
        let machine = StateMachine::new("Machine");
        let a = machine.add_state(&Command::no_requirements().named("A"));
        a.exit_state_machine().when_complete();
        a.exit_state_machine().when_complete_and(|| true);

        let graph = machine.graph.lock();
        assert_eq!(graph.states[a.index].completions.len(), 1);
    }
}
