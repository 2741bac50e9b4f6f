use proptest::prelude::*;
use wingman_core::{AxisConfig, OperatingMode};

fn axis_strategy() -> impl Strategy<Value = AxisConfig> {
    (-20000i32..20000, 1i32..20000, any::<bool>()).prop_map(|(min, width, reversed)| AxisConfig {
        id: 1,
        min_position: min,
        max_position: min + width,
        center_position: min + width / 2,
        reversed,
        speed: 0,
        pid_gains: None,
        operating_mode: OperatingMode::ExtendedPosition,
        goal_current: None,
    })
}

proptest! {
    #[test]
    fn test_clamp_idempotent(axis in axis_strategy(), value in any::<i32>()) {
        let once = axis.clamp(value);
        prop_assert_eq!(axis.clamp(once), once);
    }

    #[test]
    fn test_clamp_within_range(axis in axis_strategy(), value in any::<i32>()) {
        let clamped = axis.clamp(value);
        prop_assert!(clamped >= axis.min_position);
        prop_assert!(clamped <= axis.max_position);
    }

    #[test]
    fn test_clamp_preserves_in_range_values(axis in axis_strategy(), t in 0.0f64..=1.0) {
        let value = axis.min_position + ((axis.span() * t) as i32);
        prop_assert_eq!(axis.clamp(value), value);
    }

    #[test]
    fn test_goal_from_any_float_is_in_range(axis in axis_strategy(), value in any::<f64>()) {
        let goal = axis.goal_from_f64(value);
        prop_assert!(goal.value() >= axis.min_position);
        prop_assert!(goal.value() <= axis.max_position);
    }
}
