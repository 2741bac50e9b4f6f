//! Operator override of the computed goals

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;
use wingman_core::{AxisConfig, AxisRole, GoalPosition, SessionConfig, TeleopConfig};

/// Full stick deflection
pub const STICK_MAX: f64 = 32767.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorInput {
    /// Stick deflection in [-32767, 32767]; persists until the next stick event
    Stick { pan: i16, tilt: i16 },
    /// Goals injected directly, bypassing the mapper
    Goals { pan: Option<i32>, tilt: Option<i32> },
    /// Hand control back to the tracker
    Release,
}

#[derive(Debug, Clone, Copy)]
struct Injection {
    pan: Option<i32>,
    tilt: Option<i32>,
    at: Instant,
}

/// Latest operator input, consumed once per cycle by the control loop
#[derive(Debug, Clone, Default)]
pub struct Teleop {
    stick: (i16, i16),
    injection: Option<Injection>,
}

impl Teleop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, input: OperatorInput, now: Instant) {
        debug!(?input, "operator input");
        match input {
            OperatorInput::Stick { pan, tilt } => {
                self.stick = (pan, tilt);
                self.injection = None;
            }
            OperatorInput::Goals { pan, tilt } => {
                self.stick = (0, 0);
                self.injection = Some(Injection { pan, tilt, at: now });
            }
            OperatorInput::Release => {
                self.stick = (0, 0);
                self.injection = None;
            }
        }
    }

    fn outside_dead_zone(value: i16, config: &TeleopConfig) -> bool {
        (value as i32).abs() >= config.dead_zone as i32
    }

    /// A stick axis is deflected past the dead zone
    pub fn stick_active(&self, config: &TeleopConfig) -> bool {
        Self::outside_dead_zone(self.stick.0, config) || Self::outside_dead_zone(self.stick.1, config)
    }

    fn injection_active(&self, config: &TeleopConfig, now: Instant) -> bool {
        self.injection
            .map_or(false, |i| now.saturating_duration_since(i.at) <= config.hold())
    }

    /// Operator goals supersede the tracker
    pub fn is_active(&self, config: &TeleopConfig, now: Instant) -> bool {
        self.stick_active(config) || self.injection_active(config, now)
    }

    /// Goals for this cycle, clamped to the axis ranges.
    ///
    /// Stick goals move relative to `base`, the present position of each axis
    /// when known.
    pub fn goals(
        &self,
        config: &SessionConfig,
        base: &BTreeMap<u8, i32>,
        now: Instant,
    ) -> Vec<GoalPosition> {
        let teleop = &config.teleop;
        if self.stick_active(teleop) {
            return config
                .axes()
                .iter()
                .map(|(role, axis)| {
                    let origin = base.get(&axis.id).copied().unwrap_or(axis.center_position);
                    stick_goal(*role, axis, origin, self.stick_value(*role, teleop), teleop)
                })
                .collect();
        }

        match self.injection {
            Some(injection) if self.injection_active(teleop, now) => {
                let mut goals = Vec::with_capacity(2);
                if let Some(value) = injection.pan {
                    goals.push(config.pan.goal(value));
                }
                if let Some(value) = injection.tilt {
                    goals.push(config.tilt.goal(value));
                }
                goals
            }
            _ => Vec::new(),
        }
    }

    fn stick_value(&self, role: AxisRole, config: &TeleopConfig) -> i16 {
        match role {
            AxisRole::Pan => self.stick.0,
            AxisRole::Tilt if config.invert_tilt => self.stick.1.saturating_neg(),
            AxisRole::Tilt => self.stick.1,
        }
    }
}

fn stick_goal(
    role: AxisRole,
    axis: &AxisConfig,
    origin: i32,
    value: i16,
    config: &TeleopConfig,
) -> GoalPosition {
    if !Teleop::outside_dead_zone(value, config) {
        return axis.goal(origin);
    }
    let sensitivity = match role {
        AxisRole::Pan => config.pan_sensitivity,
        AxisRole::Tilt => config.tilt_sensitivity,
    };
    let step = (value as f64 / STICK_MAX * sensitivity).trunc() as i32;
    axis.goal(origin.saturating_add(step))
}
