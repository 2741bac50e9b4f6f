//! Image-plane to actuator goal mapping

use wingman_core::{AxisConfig, AxisRole, GoalPosition, Point2, SessionConfig};

/// Extrapolate a position along the estimated velocity by `lead_time` seconds.
/// Without a velocity estimate the position is returned unchanged.
pub fn lead(position: Point2, velocity: Option<Point2>, lead_time: f64) -> Point2 {
    match velocity {
        Some(v) if lead_time > 0.0 => {
            Point2::new(position.x + v.x * lead_time, position.y + v.y * lead_time)
        }
        _ => position,
    }
}

/// Map one normalized coordinate onto an axis.
///
/// `reverse` is the session-level inversion flag and combines with the axis's
/// own `reversed` flag. `servo_scale` multiplies the mapped value itself, not
/// its offset from the axis centre. The result is always clamped.
pub fn image_to_goal(
    normalized: f64,
    axis: &AxisConfig,
    reverse: bool,
    servo_scale: f64,
) -> GoalPosition {
    let effective = axis.orient(normalized, reverse);
    let mapped = axis.min_position as f64 + effective * axis.span();
    axis.goal_from_f64(mapped * servo_scale)
}

/// Maps fused target positions to goals for both axes of a session
#[derive(Debug, Clone)]
pub struct CoordinateMapper {
    pan: AxisConfig,
    tilt: AxisConfig,
    reverse_pan: bool,
    reverse_tilt: bool,
    servo_scale: f64,
    lead_time: f64,
}

impl CoordinateMapper {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            pan: config.pan.clone(),
            tilt: config.tilt.clone(),
            reverse_pan: config.reverse_for(AxisRole::Pan),
            reverse_tilt: config.reverse_for(AxisRole::Tilt),
            servo_scale: config.console.servo_scale,
            lead_time: config.console.lead_time,
        }
    }

    pub fn axis(&self, role: AxisRole) -> &AxisConfig {
        match role {
            AxisRole::Pan => &self.pan,
            AxisRole::Tilt => &self.tilt,
        }
    }

    /// Pan goal from x, tilt goal from y
    pub fn map(&self, position: Point2, velocity: Option<Point2>) -> [GoalPosition; 2] {
        let target = lead(position, velocity, self.lead_time);
        [
            image_to_goal(target.x, &self.pan, self.reverse_pan, self.servo_scale),
            image_to_goal(target.y, &self.tilt, self.reverse_tilt, self.servo_scale),
        ]
    }

    /// Goals that return both axes to their centres
    pub fn home(&self) -> [GoalPosition; 2] {
        [self.pan.home(), self.tilt.home()]
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
            reversed: false,
            ..AxisConfig::default_tilt()
        }
    }

    #[test]
    fn test_centre_maps_to_midpoint() {
        assert_eq!(image_to_goal(0.5, &axis(), false, 1.0).value(), 2048);
    }

    #[test]
    fn test_scale_multiplies_mapped_value() {
        assert_eq!(image_to_goal(0.5, &axis(), false, 0.5).value(), 1024);
    }

    #[test]
    fn test_reversed_axis() {
        let mut reversed = axis();
        reversed.reversed = true;
        assert_eq!(image_to_goal(0.25, &reversed, false, 1.0).value(), 3072);
        assert_eq!(image_to_goal(0.25, &axis(), true, 1.0).value(), 3072);
    }

    #[test]
    fn test_out_of_frame_is_clamped() {
        assert_eq!(image_to_goal(1.4, &axis(), false, 1.0).value(), 4096);
        assert_eq!(image_to_goal(-0.2, &axis(), false, 1.0).value(), 0);
    }

    #[test]
    fn test_lead() {
        let p = Point2::new(0.5, 0.5);
        assert_eq!(lead(p, None, 0.2), p);
        assert_eq!(lead(p, Some(Point2::new(1.0, -0.5)), 0.0), p);
        let led = lead(p, Some(Point2::new(1.0, -0.5)), 0.2);
        assert!((led.x - 0.7).abs() < 1e-12);
        assert!((led.y - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_mapper_uses_session_axes() {
        let config = SessionConfig::default();
        let mapper = CoordinateMapper::from_config(&config);
        let [pan, tilt] = mapper.map(Point2::new(0.5, 0.0), None);
        assert_eq!(pan.axis_id(), 1);
        assert_eq!(pan.value(), 0);
        assert_eq!(tilt.axis_id(), 2);
        assert_eq!(tilt.value(), 1100);
        assert_eq!(mapper.home(), [config.pan.home(), config.tilt.home()]);
    }
}
