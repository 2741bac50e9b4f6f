//! Per-axis mechanical model: limits, centre, orientation and clamping

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Which rotational degree of freedom an axis drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisRole {
    /// Horizontal rotation, follows the image x coordinate
    Pan,
    /// Vertical rotation, follows the image y coordinate
    Tilt,
}

impl fmt::Display for AxisRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisRole::Pan => write!(f, "pan"),
            AxisRole::Tilt => write!(f, "tilt"),
        }
    }
}

/// Actuator operating mode register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Current,
    Velocity,
    Position,
    /// Multi-turn position control, allows goals outside a single revolution
    ExtendedPosition,
    CurrentBasedPosition,
    Pwm,
}

impl OperatingMode {
    pub fn register_value(self) -> u8 {
        match self {
            OperatingMode::Current => 0,
            OperatingMode::Velocity => 1,
            OperatingMode::Position => 3,
            OperatingMode::ExtendedPosition => 4,
            OperatingMode::CurrentBasedPosition => 5,
            OperatingMode::Pwm => 16,
        }
    }

    pub fn from_register(value: u8) -> Option<Self> {
        match value {
            0 => Some(OperatingMode::Current),
            1 => Some(OperatingMode::Velocity),
            3 => Some(OperatingMode::Position),
            4 => Some(OperatingMode::ExtendedPosition),
            5 => Some(OperatingMode::CurrentBasedPosition),
            16 => Some(OperatingMode::Pwm),
            _ => None,
        }
    }
}

impl Default for OperatingMode {
    fn default() -> Self {
        OperatingMode::Position
    }
}

/// Position loop gains, raw register units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: u16,
    pub ki: u16,
    pub kd: u16,
}

/// Static configuration for one actuated axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Actuator id on the bus
    pub id: u8,
    pub min_position: i32,
    pub max_position: i32,
    /// Home position commanded while searching
    pub center_position: i32,
    /// Mirror the image coordinate before mapping
    #[serde(default)]
    pub reversed: bool,
    /// Goal speed register value (0 = device maximum)
    #[serde(default)]
    pub speed: u32,
    #[serde(default)]
    pub pid_gains: Option<PidGains>,
    #[serde(default)]
    pub operating_mode: OperatingMode,
    /// Goal current limit written at start-up, if any
    #[serde(default)]
    pub goal_current: Option<u16>,
}

impl AxisConfig {
    /// Pan axis defaults: multi-turn range around zero
    pub fn default_pan() -> Self {
        Self {
            id: 1,
            min_position: -16000,
            max_position: 16000,
            center_position: 0,
            reversed: false,
            speed: 0,
            pid_gains: None,
            operating_mode: OperatingMode::ExtendedPosition,
            goal_current: None,
        }
    }

    /// Tilt axis defaults
    pub fn default_tilt() -> Self {
        Self {
            id: 2,
            min_position: 1100,
            max_position: 2200,
            center_position: 1100,
            reversed: false,
            speed: 0,
            pid_gains: None,
            operating_mode: OperatingMode::Position,
            goal_current: None,
        }
    }

    /// Validate limits
    pub fn validate(&self) -> Result<()> {
        if self.min_position >= self.max_position {
            return Err(Error::InvalidAxis(format!(
                "axis {}: min_position {} must be below max_position {}",
                self.id, self.min_position, self.max_position
            )));
        }

        if self.center_position < self.min_position || self.center_position > self.max_position {
            return Err(Error::InvalidAxis(format!(
                "axis {}: center_position {} outside [{}, {}]",
                self.id, self.center_position, self.min_position, self.max_position
            )));
        }

        if self.id >= 0xFD {
            return Err(Error::InvalidAxis(format!(
                "axis id {} is reserved",
                self.id
            )));
        }

        Ok(())
    }

    /// Clamp a position into `[min_position, max_position]`, logging when the
    /// input falls outside.
    pub fn clamp(&self, value: i32) -> i32 {
        let clamped = value.max(self.min_position).min(self.max_position);
        if clamped != value {
            warn!(
                axis = self.id,
                value,
                min = self.min_position,
                max = self.max_position,
                "goal position out of range, clamping to {}",
                clamped
            );
        }
        clamped
    }

    /// Apply axis orientation to a normalized coordinate.
    /// `extra_reverse` is the session-level inversion flag for this axis.
    pub fn orient(&self, normalized: f64, extra_reverse: bool) -> f64 {
        if self.reversed ^ extra_reverse {
            1.0 - normalized
        } else {
            normalized
        }
    }

    /// Build a goal for this axis; the value is always clamped.
    pub fn goal(&self, value: i32) -> GoalPosition {
        GoalPosition {
            axis_id: self.id,
            value: self.clamp(value),
        }
    }

    /// Build a goal from a continuous value, rounding to the nearest step.
    /// Non-finite values fall back to the centre position.
    pub fn goal_from_f64(&self, value: f64) -> GoalPosition {
        if !value.is_finite() {
            warn!(axis = self.id, "non-finite goal position, using centre");
            return self.home();
        }
        // `as` saturates at the i32 bounds
        self.goal(value.round() as i32)
    }

    /// Goal that drives the axis to its centre position
    pub fn home(&self) -> GoalPosition {
        self.goal(self.center_position)
    }

    pub fn span(&self) -> f64 {
        (self.max_position as f64) - (self.min_position as f64)
    }
}

/// A goal position that has passed through axis clamping.
///
/// The only constructors are on [`AxisConfig`], so every value handed to the
/// bus is inside its axis range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GoalPosition {
    axis_id: u8,
    value: i32,
}

impl GoalPosition {
    pub fn axis_id(&self) -> u8 {
        self.axis_id
    }

    pub fn value(&self) -> i32 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis() -> AxisConfig {
        AxisConfig {
            id: 1,
            min_position: 0,
            max_position: 4096,
            center_position: 2048,
            ..AxisConfig::default_pan()
        }
    }

    #[test]
    fn test_clamp_within_range() {
        assert_eq!(axis().clamp(1000), 1000);
        assert_eq!(axis().clamp(0), 0);
        assert_eq!(axis().clamp(4096), 4096);
    }

    #[test]
    fn test_clamp_out_of_range() {
        assert_eq!(axis().clamp(-5), 0);
        assert_eq!(axis().clamp(5000), 4096);
        assert_eq!(axis().clamp(i32::MIN), 0);
        assert_eq!(axis().clamp(i32::MAX), 4096);
    }

    #[test]
    fn test_goal_is_clamped() {
        let goal = axis().goal(9000);
        assert_eq!(goal.axis_id(), 1);
        assert_eq!(goal.value(), 4096);
    }

    #[test]
    fn test_goal_from_non_finite_is_home() {
        assert_eq!(axis().goal_from_f64(f64::NAN).value(), 2048);
        assert_eq!(axis().goal_from_f64(f64::INFINITY).value(), 2048);
    }

    #[test]
    fn test_goal_from_f64_rounds() {
        assert_eq!(axis().goal_from_f64(1023.6).value(), 1024);
        assert_eq!(axis().goal_from_f64(1e12).value(), 4096);
    }

    #[test]
    fn test_orient() {
        let mut a = axis();
        assert_eq!(a.orient(0.25, false), 0.25);
        assert_eq!(a.orient(0.25, true), 0.75);
        a.reversed = true;
        assert_eq!(a.orient(0.25, false), 0.75);
        // Two inversions cancel
        assert_eq!(a.orient(0.25, true), 0.25);
    }

    #[test]
    fn test_validate() {
        assert!(axis().validate().is_ok());
        assert!(AxisConfig::default_pan().validate().is_ok());
        assert!(AxisConfig::default_tilt().validate().is_ok());

        let mut bad = axis();
        bad.min_position = 5000;
        assert!(bad.validate().is_err());

        let mut bad = axis();
        bad.center_position = -1;
        assert!(bad.validate().is_err());

        let mut bad = axis();
        bad.id = 0xFE;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_operating_mode_registers() {
        assert_eq!(OperatingMode::ExtendedPosition.register_value(), 4);
        assert_eq!(OperatingMode::from_register(3), Some(OperatingMode::Position));
        assert_eq!(OperatingMode::from_register(2), None);
    }
}
