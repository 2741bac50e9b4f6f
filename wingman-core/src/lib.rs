//! wingman-core: shared model for the wingman pan/tilt tracker
//!
//! Provides:
//! - Perception data model (frames, detections, fiducials)
//! - Axis model with range clamping and orientation
//! - Operator console settings and the per-session configuration bundle

pub mod error;
pub mod types;
pub mod axis;
pub mod config;

pub use error::{Error, Result};
pub use types::{Point2, Detection, FiducialDetection, Frame};
pub use axis::{AxisConfig, AxisRole, GoalPosition, OperatingMode, PidGains};
pub use config::{
    BusSettings, ConsoleSettings, FusionMode, SessionConfig, TeleopConfig, TrackingConfig,
};
