//! Example robot built with Cadence.
//!
//! This example demonstrates how a fixed-period control loop shares a small
//! set of mechanisms between independently written commands. The robot is
//! simulated: commands move numbers in a shared [`RobotState`] instead of
//! driving motors.
//!
//! # Mechanisms
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────┐   ┌────────┐
//! │ Drivetrain               │   │ Elevator │   │ Intake │
//! │  ┌──────┐    ┌───────┐   │   └──────────┘   └────────┘
//! │  │ Left │    │ Right │   │
//! │  └──────┘    └───────┘   │
//! └──────────────────────────┘
//! ```
//!
//! Requiring the drivetrain requires both sides. A turn-in-place command holds
//! the whole drivetrain and lends one side to each of its two children.

mod config;
mod robot;

pub use config::{ConfigError, LoopConfig};
pub use robot::{Robot, RobotState};
