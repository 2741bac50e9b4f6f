//! wingman-track: from detections to actuator goals
//!
//! Provides:
//! - Fusion of fiducial and generic detections into one observation per frame
//! - A constant-velocity estimator that bridges missed detections
//! - Mapping of normalized image positions onto axis goal positions

pub mod fusion;
pub mod estimator;
pub mod mapper;

pub use fusion::{FusionPolicy, Observation};
pub use estimator::{EstimateOutput, EstimateSource, EstimatorParams, TargetEstimator, TrackEstimate};
pub use mapper::{image_to_goal, lead, CoordinateMapper};
