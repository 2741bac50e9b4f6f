//! wingman-control: the tracking control loop
//!
//! Provides:
//! - Perception sources (in-process channel, newline-delimited JSON streams)
//! - The search / track / home state machine
//! - Operator teleoperation overrides
//! - The control loop and its handle

pub mod error;
pub mod state;
pub mod teleop;
pub mod perception;
pub mod orchestrator;

pub use error::{ControlError, Result};
pub use state::{ControlState, TrackingMode};
pub use teleop::{OperatorInput, Teleop};
pub use perception::{ChannelSource, JsonLinesSource, PerceptionSource};
pub use orchestrator::{ControlCommand, ControlHandle, ControlLoop, CycleReport, GoalSource};
