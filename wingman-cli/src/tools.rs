//! Bench tools: manual position check and the square sweep

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use wingman_bus::{BusClient, Transport};
use wingman_core::{GoalPosition, SessionConfig};

/// Square path around the centres: right, up, across, down, back home
pub fn sweep_path(config: &SessionConfig, pan_offset: i32, tilt_offset: i32) -> Vec<[GoalPosition; 2]> {
    let (pan, tilt) = (&config.pan, &config.tilt);
    let (pc, tc) = (pan.center_position, tilt.center_position);
    [
        (pc, tc),
        (pc.saturating_add(pan_offset), tc),
        (pc.saturating_add(pan_offset), tc.saturating_add(tilt_offset)),
        (pc.saturating_sub(pan_offset), tc.saturating_add(tilt_offset)),
        (pc.saturating_sub(pan_offset), tc.saturating_sub(tilt_offset)),
        (pc, tc),
    ]
    .into_iter()
    .map(|(p, t)| [pan.goal(p), tilt.goal(t)])
    .collect()
}

pub async fn sweep<T: Transport>(
    bus: &mut BusClient<T>,
    config: &SessionConfig,
    pan_offset: i32,
    tilt_offset: i32,
    dwell: Duration,
    rounds: u32,
) -> Result<()> {
    for (role, axis) in config.axes() {
        let failures = bus.configure_axis(axis, config.speed_for(role));
        for (what, e) in &failures {
            warn!(axis = %role, id = axis.id, "Failed to {}: {}", what, e);
        }
        if let Some((what, e)) = failures.into_iter().next() {
            bail!("{} axis setup failed ({}): {}", role, what, e);
        }
    }

    let path = sweep_path(config, pan_offset, tilt_offset);
    for round in 1..=rounds {
        info!("Sweep round {}/{}", round, rounds);
        for goals in &path {
            if let Err(e) = bus.set_goal_positions(goals) {
                warn!("Goal write failed: {}", e);
            }
            println!("pan {:>6}  tilt {:>6}", goals[0].value(), goals[1].value());
            tokio::time::sleep(dwell).await;
        }
    }
    Ok(())
}

/// Release the axes, wait for the operator, then print where the mount is
pub async fn positions<T: Transport>(
    bus: &mut BusClient<T>,
    config: &SessionConfig,
    wait: bool,
) -> Result<()> {
    for id in config.axis_ids() {
        if let Err(e) = bus.set_torque(id, false) {
            warn!(id, "Failed to disable torque: {}", e);
        }
    }

    if wait {
        println!("Torque is off. Move the mount by hand, then press Enter.");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    }

    let present = match bus.get_present_positions(&config.axis_ids()) {
        Ok(present) => present,
        Err(e) => {
            warn!("Present positions unknown: {}", e);
            BTreeMap::new()
        }
    };
    for (role, axis) in config.axes() {
        match present.get(&axis.id) {
            Some(value) => println!("{:<4} (id {}): {}", role.to_string(), axis.id, value),
            None => println!("{:<4} (id {}): unknown", role.to_string(), axis.id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wingman_bus::SimulatedBus;

    #[test]
    fn test_sweep_path_is_clamped() {
        let config = SessionConfig::default();
        let path = sweep_path(&config, 1000, 200);
        let values: Vec<(i32, i32)> = path.iter().map(|[p, t]| (p.value(), t.value())).collect();
        assert_eq!(
            values,
            vec![
                (0, 1100),
                (1000, 1100),
                (1000, 1300),
                (-1000, 1300),
                (-1000, 1100),
                (0, 1100),
            ]
        );
    }

    #[test]
    fn test_sweep_path_large_offsets_saturate() {
        let config = SessionConfig::default();
        let path = sweep_path(&config, i32::MAX, i32::MIN);
        for [pan, tilt] in &path {
            assert!((-16000..=16000).contains(&pan.value()));
            assert!((1100..=2200).contains(&tilt.value()));
        }
    }

    #[tokio::test]
    async fn test_sweep_configures_modes_before_moving() {
        let sim = SimulatedBus::with_servos(&[1, 2]);
        let mut bus = BusClient::new(sim.clone(), Duration::from_millis(20));
        let config = SessionConfig::default();

        sweep(&mut bus, &config, 1000, 200, Duration::from_millis(1), 1)
            .await
            .unwrap();

        assert_eq!(sim.operating_mode(1), Some(4));
        assert_eq!(sim.operating_mode(2), Some(3));
        let pan: Vec<i32> = sim
            .goal_history()
            .into_iter()
            .filter(|(id, _)| *id == 1)
            .map(|(_, value)| value)
            .collect();
        assert_eq!(pan, vec![0, 1000, 1000, -1000, -1000, 0]);
    }

    #[tokio::test]
    async fn test_sweep_stops_when_setup_fails() {
        let sim = SimulatedBus::with_servos(&[1, 2]);
        sim.set_unresponsive(2, true);
        let mut bus = BusClient::new(sim.clone(), Duration::from_millis(5));

        let result = sweep(&mut bus, &SessionConfig::default(), 1000, 200, Duration::ZERO, 1).await;
        assert!(result.is_err());
        assert_eq!(sim.sync_write_count(), 0);
    }

    #[tokio::test]
    async fn test_positions_tolerates_failed_read() {
        let sim = SimulatedBus::with_servos(&[1, 2]);
        sim.set_unresponsive(2, true);
        let mut bus = BusClient::new(sim.clone(), Duration::from_millis(5));

        positions(&mut bus, &SessionConfig::default(), false).await.unwrap();
        assert_eq!(sim.torque_enabled(1), Some(false));
    }
}
