//! Example robot control loop.
//!
//! Runs the autonomous routine on a simulated robot, ticking the scheduler
//! once per loop period.
//!
//! # Usage
//!
//! ```bash
//! robot
//! ```
//!
//! # Configuration
//!
//! Read from the environment (or a `.env` file):
//!
//! - `CADENCE_PERIOD_MS` - loop period in milliseconds (default 20)
//! - `CADENCE_TICKS` - stop after this many ticks (default: run until Ctrl-C)
//! - `CADENCE_LOG_FORMAT` - `pretty`, `compact` or `json` (default compact)

use cadence_commands::prelude::*;
use cadence_telemetry::{EventLogger, TracingSetup};
use example::{LoopConfig, Robot};
use tokio::time::MissedTickBehavior;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match LoopConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            TracingSetup::new().init();
            tracing::error!(error = %error, "Invalid configuration");
            std::process::exit(1);
        }
    };

    TracingSetup::new()
        .with_format(config.log_format)
        .with_env_filter("info,cadence_commands=debug")
        .init();

    // Initialize scheduler and mechanisms
    let scheduler = Scheduler::new();
    EventLogger::new()
        .with_resumptions(false)
        .attach(&scheduler);

    let robot = match Robot::new(&scheduler) {
        Ok(robot) => robot,
        Err(error) => {
            tracing::error!(error = %error, "Failed to configure default commands");
            std::process::exit(1);
        }
    };

    robot.bind_triggers(&scheduler);
    scheduler.schedule(&robot.autonomous());

    tracing::info!(
        period_ms = config.period.as_millis(),
        ticks = ?config.ticks,
        "Control loop started"
    );

    let mut interval = tokio::time::interval(config.period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }

        // A failing command has already been removed; keep the loop alive.
        if let Err(error) = scheduler.run() {
            tracing::error!(
                command = error.command().name(),
                error = %error.error(),
                "Command failed"
            );
        }

        let overrun = scheduler
            .last_run_time()
            .filter(|elapsed| *elapsed > config.period);
        if let Some(elapsed) = overrun {
            tracing::warn!(
                elapsed_us = elapsed.as_micros(),
                period_us = config.period.as_micros(),
                "Loop overrun"
            );
        }

        ticks += 1;
        if config.ticks.is_some_and(|limit| ticks >= limit) {
            break;
        }
    }

    scheduler.cancel_all();
    tracing::info!(ticks, state = ?robot.state(), "Control loop finished");
}
