//! Simulated robot mechanisms and the commands that drive them.

use std::sync::Arc;
use std::time::Duration;

use cadence_commands::prelude::*;
use parking_lot::Mutex;

/// Highest reachable elevator position, in meters.
pub const MAX_ELEVATOR_HEIGHT: f64 = 1.5;

/// Elevator travel per tick while moving to a setpoint.
const ELEVATOR_STEP: f64 = 0.05;

/// Elevator travel per tick while settling under gravity.
const SETTLE_STEP: f64 = 0.01;

/// Ticks the intake must run before a game piece is seated.
const INTAKE_TICKS: u32 = 25;

/// How long the intake runs in reverse to eject a piece.
const EJECT_TIME: Duration = Duration::from_millis(300);

/// How long a piece must sit at the bottom before it is ejected.
const SCORE_DELAY: Duration = Duration::from_millis(200);

/// Simulated sensor and actuator readings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RobotState {
    /// Elevator height in meters.
    pub elevator_height: f64,
    /// Left drive output, -1.0 to 1.0.
    pub left_output: f64,
    /// Right drive output, -1.0 to 1.0.
    pub right_output: f64,
    /// Whether the intake is spinning.
    pub intake_running: bool,
    /// Whether a game piece is held.
    pub has_piece: bool,
}

type SetOutput = fn(&mut RobotState, f64);

/// The robot's mechanisms and the shared state its commands act on.
#[derive(Clone)]
pub struct Robot {
    left: Mechanism,
    right: Mechanism,
    drivetrain: Mechanism,
    elevator: Mechanism,
    intake: Mechanism,
    state: Arc<Mutex<RobotState>>,
}

impl Robot {
    /// Creates the robot's mechanisms on `scheduler` and installs their
    /// default commands.
    ///
    /// # Errors
    ///
    /// Returns [`DefaultCommandError`] if a default command is rejected.
    pub fn new(scheduler: &Scheduler) -> Result<Self, DefaultCommandError> {
        let left = Mechanism::new("Left", scheduler);
        let right = Mechanism::new("Right", scheduler);
        let drivetrain =
            Mechanism::with_nested("Drivetrain", scheduler, [left.clone(), right.clone()]);
        let elevator = Mechanism::new("Elevator", scheduler);
        let intake = Mechanism::new("Intake", scheduler);

        let robot = Self {
            left,
            right,
            drivetrain,
            elevator,
            intake,
            state: Arc::new(Mutex::new(RobotState::default())),
        };

        robot.drivetrain.set_default_command(robot.drivetrain.idle())?;
        robot.elevator.set_default_command(robot.settle_elevator())?;
        robot.intake.set_default_command(robot.intake.idle())?;
        Ok(robot)
    }

    /// Returns a copy of the current readings.
    #[must_use]
    pub fn state(&self) -> RobotState {
        *self.state.lock()
    }

    /// Returns the drivetrain, which contains both drive sides.
    #[must_use]
    pub fn drivetrain(&self) -> &Mechanism {
        &self.drivetrain
    }

    /// Returns the left drive side.
    #[must_use]
    pub fn left(&self) -> &Mechanism {
        &self.left
    }

    /// Returns the right drive side.
    #[must_use]
    pub fn right(&self) -> &Mechanism {
        &self.right
    }

    /// Returns the elevator.
    #[must_use]
    pub fn elevator(&self) -> &Mechanism {
        &self.elevator
    }

    /// Returns the intake.
    #[must_use]
    pub fn intake(&self) -> &Mechanism {
        &self.intake
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Elevator
    // ─────────────────────────────────────────────────────────────────────────

    /// Lets the elevator sink to the bottom, then holds it there.
    ///
    /// This is the elevator's default command.
    #[must_use]
    pub fn settle_elevator(&self) -> Command {
        let state = self.state.clone();
        self.elevator
            .run(move |co| {
                let state = state.clone();
                async move {
                    loop {
                        let resting = {
                            let mut state = state.lock();
                            state.elevator_height = (state.elevator_height - SETTLE_STEP).max(0.0);
                            state.elevator_height <= 0.0
                        };
                        if resting {
                            return co.park().await;
                        }
                        if !co.yield_now().await {
                            return Ok(());
                        }
                    }
                }
            })
            .with_priority(Command::LOWEST_PRIORITY)
            .named("Settle Elevator")
    }

    /// Moves the elevator to `height` meters.
    ///
    /// Fails immediately if `height` is out of reach.
    #[must_use]
    pub fn move_elevator_to(&self, height: f64) -> Command {
        let state = self.state.clone();
        self.elevator
            .run(move |co| {
                let state = state.clone();
                async move {
                    if !(0.0..=MAX_ELEVATOR_HEIGHT).contains(&height) {
                        return Err(CommandError::failed(format!(
                            "elevator height {height} is outside 0..={MAX_ELEVATOR_HEIGHT}"
                        )));
                    }
                    loop {
                        let arrived = {
                            let mut state = state.lock();
                            let delta = height - state.elevator_height;
                            if delta.abs() <= ELEVATOR_STEP {
                                state.elevator_height = height;
                                true
                            } else {
                                state.elevator_height += ELEVATOR_STEP.copysign(delta);
                                false
                            }
                        };
                        if arrived || !co.yield_now().await {
                            return Ok(());
                        }
                    }
                }
            })
            .named(format!("Elevator To {height:.2}"))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Intake
    // ─────────────────────────────────────────────────────────────────────────

    /// Runs the intake until a game piece is seated.
    #[must_use]
    pub fn collect(&self) -> Command {
        let state = self.state.clone();
        self.intake
            .run(move |co| {
                let state = state.clone();
                async move {
                    state.lock().intake_running = true;
                    let mut ticks = 0;
                    let seated = co
                        .wait_until(|| {
                            ticks += 1;
                            ticks > INTAKE_TICKS
                        })
                        .await;

                    let mut state = state.lock();
                    state.intake_running = false;
                    state.has_piece |= seated;
                    Ok(())
                }
            })
            .named("Collect")
    }

    /// Runs the intake in reverse until the held piece is out.
    #[must_use]
    pub fn eject(&self) -> Command {
        let state = self.state.clone();
        self.intake
            .run(move |co| {
                let state = state.clone();
                async move {
                    state.lock().intake_running = true;
                    co.wait(EJECT_TIME).await;
                    let mut state = state.lock();
                    state.intake_running = false;
                    state.has_piece = false;
                    Ok(())
                }
            })
            .named("Eject")
    }

    /// Binds the robot's automatic behaviors on `scheduler`.
    ///
    /// A piece held with the elevator lowered for [`SCORE_DELAY`] is ejected.
    pub fn bind_triggers(&self, scheduler: &Scheduler) {
        let state = self.state.clone();
        Trigger::new(scheduler, move || {
            let state = state.lock();
            state.has_piece && state.elevator_height <= 0.0
        })
        .debounce(SCORE_DELAY)
        .on_true(&self.eject());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Drivetrain
    // ─────────────────────────────────────────────────────────────────────────

    /// Drives straight at `output` for `duration`.
    #[must_use]
    pub fn drive_for(&self, output: f64, duration: Duration) -> Command {
        let state = self.state.clone();
        self.drivetrain
            .run(move |co| {
                let state = state.clone();
                async move {
                    {
                        let mut state = state.lock();
                        state.left_output = output;
                        state.right_output = output;
                    }
                    co.wait(duration).await;

                    let mut state = state.lock();
                    state.left_output = 0.0;
                    state.right_output = 0.0;
                    Ok(())
                }
            })
            .named("Drive")
    }

    /// Spins in place for `duration` by driving each side in a separate
    /// child command.
    #[must_use]
    pub fn turn_in_place(&self, output: f64, duration: Duration) -> Command {
        let sides = [
            self.spin(&self.left, "Spin Left", output, duration, |s, v| {
                s.left_output = v;
            }),
            self.spin(&self.right, "Spin Right", -output, duration, |s, v| {
                s.right_output = v;
            }),
        ];
        Command::requiring([&self.drivetrain])
            .executing(move |co| {
                let sides = sides.clone();
                async move { co.await_all(&sides).await }
            })
            .named("Turn In Place")
    }

    fn spin(
        &self,
        side: &Mechanism,
        name: &str,
        output: f64,
        duration: Duration,
        set: SetOutput,
    ) -> Command {
        let state = self.state.clone();
        side.run(move |co| {
            let state = state.clone();
            async move {
                set(&mut state.lock(), output);
                co.wait(duration).await;
                set(&mut state.lock(), 0.0);
                Ok(())
            }
        })
        .named(name)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Autonomous
    // ─────────────────────────────────────────────────────────────────────────

    /// The autonomous routine: drive out, raise the elevator while
    /// collecting a piece, turn around, and lower the elevator.
    ///
    /// The routine itself requires nothing; each step claims only the
    /// mechanisms it moves.
    #[must_use]
    pub fn autonomous(&self) -> Command {
        let drive = self.drive_for(0.5, Duration::from_secs(1));
        let raise = self.move_elevator_to(1.0);
        let collect = self.collect();
        let turn = self.turn_in_place(0.4, Duration::from_millis(500));
        let lower = self.move_elevator_to(0.0);

        Command::no_requirements()
            .executing(move |co| {
                let drive = drive.clone();
                let pickup = [raise.clone(), collect.clone()];
                let turn = turn.clone();
                let lower = lower.clone();
                async move {
                    co.schedule_and_wait(&drive).await?;
                    co.await_all(&pickup).await?;
                    co.schedule_and_wait(&turn).await?;
                    co.schedule_and_wait(&lower).await
                }
            })
            .named("Autonomous")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use cadence_commands::time::MockClock;

    use super::*;

    const PERIOD: Duration = Duration::from_millis(20);

    fn robot() -> (Scheduler, Robot, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let scheduler = Scheduler::builder().with_clock(clock.clone()).build();
        let robot = Robot::new(&scheduler).unwrap();
        (scheduler, robot, clock)
    }

    fn holder(scheduler: &Scheduler, mechanism: &Mechanism) -> Option<String> {
        scheduler
            .holder_of(mechanism)
            .map(|command| command.name().to_string())
    }

    fn tick(scheduler: &Scheduler, clock: &MockClock) {
        scheduler.run().unwrap();
        clock.advance(PERIOD);
    }

    #[test]
    fn defaults_claim_every_mechanism() {
        let (scheduler, robot, clock) = robot();
        tick(&scheduler, &clock);

        assert_eq!(
            holder(&scheduler, robot.drivetrain()).as_deref(),
            Some("Drivetrain[IDLE]")
        );
        assert_eq!(
            holder(&scheduler, robot.elevator()).as_deref(),
            Some("Settle Elevator")
        );
        assert_eq!(
            holder(&scheduler, robot.intake()).as_deref(),
            Some("Intake[IDLE]")
        );
    }

    #[test]
    fn elevator_settles_after_a_move() {
        let (scheduler, robot, clock) = robot();
        let raise = robot.move_elevator_to(0.5);
        scheduler.schedule(&raise);
        tick(&scheduler, &clock);
        while scheduler.is_running(&raise) {
            tick(&scheduler, &clock);
        }
        assert_eq!(robot.state().elevator_height, 0.5);
        assert_eq!(
            holder(&scheduler, robot.elevator()).as_deref(),
            Some("Settle Elevator")
        );

        tick(&scheduler, &clock);
        assert!(robot.state().elevator_height < 0.5);
    }

    #[test]
    fn unreachable_height_fails() {
        let (scheduler, robot, _clock) = robot();
        scheduler.schedule(&robot.move_elevator_to(2.0));

        let error = scheduler.run().unwrap_err();
        assert_eq!(error.command().name(), "Elevator To 2.00");
        assert!(error.to_string().contains("outside"), "{error}");
        assert_eq!(robot.state().elevator_height, 0.0);
    }

    #[test]
    fn turn_lends_each_side_to_a_child() {
        let (scheduler, robot, clock) = robot();
        scheduler.schedule(&robot.turn_in_place(0.3, Duration::from_millis(100)));
        tick(&scheduler, &clock);

        assert_eq!(
            holder(&scheduler, robot.drivetrain()).as_deref(),
            Some("Turn In Place")
        );
        assert_eq!(holder(&scheduler, robot.left()).as_deref(), Some("Spin Left"));
        assert_eq!(holder(&scheduler, robot.right()).as_deref(), Some("Spin Right"));

        let state = robot.state();
        assert_eq!(state.left_output, 0.3);
        assert_eq!(state.right_output, -0.3);
    }

    #[test]
    fn driving_interrupts_a_turn() {
        let (scheduler, robot, clock) = robot();
        let turn = robot.turn_in_place(0.3, Duration::from_secs(1));
        scheduler.schedule(&turn);
        tick(&scheduler, &clock);

        let drive = robot.drive_for(0.8, Duration::from_secs(1));
        scheduler.schedule(&drive);
        tick(&scheduler, &clock);

        assert!(!scheduler.is_running(&turn));
        assert!(scheduler.is_running(&drive));
        assert_eq!(holder(&scheduler, robot.left()).as_deref(), Some("Drive"));
    }

    #[test]
    fn autonomous_routine_runs_to_completion() {
        let (scheduler, robot, clock) = robot();
        let auto = robot.autonomous();
        scheduler.schedule(&auto);

        let mut ticks = 0;
        tick(&scheduler, &clock);
        while scheduler.is_scheduled_or_running(&auto) && ticks < 500 {
            tick(&scheduler, &clock);
            ticks += 1;
        }

        assert!(!scheduler.is_scheduled_or_running(&auto), "still running after {ticks} ticks");
        let state = robot.state();
        assert!(state.has_piece);
        assert!(!state.intake_running);
        assert_eq!(state.elevator_height, 0.0);
        assert_eq!(state.left_output, 0.0);
        assert_eq!(state.right_output, 0.0);
    }

    #[test]
    fn lowered_piece_is_ejected() {
        let (scheduler, robot, clock) = robot();
        robot.bind_triggers(&scheduler);
        robot.state.lock().has_piece = true;

        tick(&scheduler, &clock);
        assert_eq!(holder(&scheduler, robot.intake()).as_deref(), Some("Intake[IDLE]"));

        let mut ticks = 0;
        while robot.state().has_piece && ticks < 100 {
            tick(&scheduler, &clock);
            ticks += 1;
        }

        assert!(!robot.state().has_piece, "piece still held after {ticks} ticks");
        assert!(!robot.state().intake_running);
    }
}
