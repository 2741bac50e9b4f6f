//! The per-frame control loop
//!
//! One cycle: fuse the frame's detections, advance the estimator, map the
//! estimate to goals, let operator input override them, and command the bus.
//! The bus is only ever touched from the loop itself; everything else talks to
//! the loop through [`ControlHandle`].

use crate::error::{ControlError, Result};
use crate::perception::PerceptionSource;
use crate::state::{ControlState, TrackingMode};
use crate::teleop::{OperatorInput, Teleop};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use wingman_bus::{BusClient, BusError, Transport};
use wingman_core::{Frame, GoalPosition, SessionConfig};
use wingman_track::{
    CoordinateMapper, EstimateOutput, EstimatorParams, FusionPolicy, Observation, TargetEstimator,
};

const COMMAND_QUEUE_SIZE: usize = 64;
const STATUS_QUEUE_SIZE: usize = 256;

/// Requests accepted by a running loop
#[derive(Debug, Clone)]
pub enum ControlCommand {
    Stop,
    /// Swap the session configuration between cycles
    UpdateConfig(Box<SessionConfig>),
    Operator(OperatorInput),
}

/// Who produced the goals of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalSource {
    Tracker,
    Home,
    Operator,
    None,
}

/// Status of one cycle, published on the status stream
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub mode: TrackingMode,
    pub observation: Observation,
    pub estimate: Option<EstimateOutput>,
    pub goal_source: GoalSource,
    pub goals: Vec<GoalPosition>,
    /// The goals left the host
    pub commanded: bool,
    /// Present positions, when read this cycle
    pub present_positions: Option<BTreeMap<u8, i32>>,
    pub errors: Vec<String>,
}

/// Cloneable front end of a control loop
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    status: broadcast::Sender<CycleReport>,
}

impl ControlHandle {
    async fn send(&self, command: ControlCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ControlError::Stopped)
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(ControlCommand::Stop).await
    }

    /// Validate and queue a new configuration
    pub async fn update_config(&self, config: SessionConfig) -> Result<()> {
        config.validate()?;
        self.send(ControlCommand::UpdateConfig(Box::new(config))).await
    }

    pub async fn operator_input(&self, input: OperatorInput) -> Result<()> {
        self.send(ControlCommand::Operator(input)).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.status.subscribe()
    }
}

pub struct ControlLoop<T: Transport> {
    config: SessionConfig,
    bus: BusClient<T>,
    fusion: FusionPolicy,
    estimator: TargetEstimator,
    mapper: CoordinateMapper,
    state: ControlState,
    teleop: Teleop,
    teleop_was_active: bool,
    present: BTreeMap<u8, i32>,
    cycles: u64,
    commands_tx: mpsc::Sender<ControlCommand>,
    commands_rx: mpsc::Receiver<ControlCommand>,
    status: broadcast::Sender<CycleReport>,
}

impl<T: Transport> ControlLoop<T> {
    pub fn new(config: SessionConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let bus = BusClient::new(transport, config.bus.timeout());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (status, _) = broadcast::channel(STATUS_QUEUE_SIZE);

        Ok(Self {
            fusion: FusionPolicy::from_config(&config.console, &config.tracking),
            estimator: TargetEstimator::new(EstimatorParams::from_config(
                &config.console,
                &config.tracking,
            )),
            mapper: CoordinateMapper::from_config(&config),
            config,
            bus,
            state: ControlState::new(),
            teleop: Teleop::new(),
            teleop_was_active: false,
            present: BTreeMap::new(),
            cycles: 0,
            commands_tx,
            commands_rx,
            status,
        })
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            commands: self.commands_tx.clone(),
            status: self.status.clone(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn estimator(&self) -> &TargetEstimator {
        &self.estimator
    }

    /// Configure every axis and enable torque.
    ///
    /// Failures are logged and returned; the loop can run without them.
    pub fn initialize(&mut self) -> Vec<(u8, BusError)> {
        let mut failures = Vec::new();
        for (role, axis) in self.config.axes() {
            let speed = self.config.speed_for(role);
            for (what, e) in self.bus.configure_axis(axis, speed) {
                warn!(axis = %role, id = axis.id, "Failed to {}: {}", what, e);
                failures.push((axis.id, e));
            }
        }

        if failures.is_empty() {
            info!("Axes initialized: {:?}", self.config.axis_ids());
        }
        failures
    }

    /// Replace the session configuration. The track survives; axes are
    /// reconfigured when their hardware settings changed.
    pub fn update_config(&mut self, config: SessionConfig) -> Result<()> {
        config.validate()?;
        let reinit = config.pan != self.config.pan
            || config.tilt != self.config.tilt
            || config.console.servo_speed != self.config.console.servo_speed;

        self.fusion = FusionPolicy::from_config(&config.console, &config.tracking);
        self.estimator
            .set_params(EstimatorParams::from_config(&config.console, &config.tracking));
        self.mapper = CoordinateMapper::from_config(&config);
        self.bus.set_timeout(config.bus.timeout());
        self.config = config;
        info!("Session configuration updated");

        if reinit {
            self.initialize();
            self.state.request_home();
        }
        Ok(())
    }

    pub fn operator_input(&mut self, input: OperatorInput, now: Instant) {
        self.teleop.apply(input, now);
    }

    fn read_telemetry(&mut self, errors: &mut Vec<String>) -> Option<BTreeMap<u8, i32>> {
        match self.bus.get_present_positions(&self.config.axis_ids()) {
            Ok(positions) => {
                self.present = positions.clone();
                Some(positions)
            }
            Err(e) => {
                warn!("Present position unknown: {}", e);
                self.present.clear();
                errors.push(e.to_string());
                None
            }
        }
    }

    /// Run one control cycle at `now` on `frame`, or on nothing when the
    /// perception source stalled.
    pub fn cycle(&mut self, frame: Option<&Frame>, now: Instant) -> CycleReport {
        self.cycles += 1;
        let mut errors = Vec::new();

        let observation = frame
            .map(|f| self.fusion.select(f))
            .unwrap_or(Observation::None);

        if observation.is_some() {
            if let Some(from) = self.state.on_observation(now) {
                info!("Target acquired while {}", from);
            }
        } else if self.state.check_timeout(now, self.config.tracking.detection_timeout()) {
            info!(
                "No target for {:?}, returning home",
                self.config.tracking.detection_timeout()
            );
            self.estimator.reset();
        }

        let estimate = if self.state.mode == TrackingMode::Tracking {
            self.estimator.step(observation.centroid(), now)
        } else {
            None
        };
        if let Some(estimate) = &estimate {
            self.state.last_valid_centroid = Some(estimate.centroid);
        }

        let teleop_active = self.teleop.is_active(&self.config.teleop, now);
        if self.teleop_was_active && !teleop_active {
            debug!("Operator released control");
            self.state.request_home();
        }
        self.teleop_was_active = teleop_active;

        let interval = self.config.tracking.telemetry_interval as u64;
        let telemetry_due = (interval > 0 && self.cycles % interval == 0)
            || self.teleop.stick_active(&self.config.teleop);
        let present_positions = if telemetry_due {
            self.read_telemetry(&mut errors)
        } else {
            None
        };

        let (goal_source, goals) = if teleop_active {
            (
                GoalSource::Operator,
                self.teleop.goals(&self.config, &self.present, now),
            )
        } else {
            match (self.state.mode, &estimate) {
                (TrackingMode::Tracking, Some(e)) => (
                    GoalSource::Tracker,
                    self.mapper.map(e.centroid, e.velocity).to_vec(),
                ),
                (TrackingMode::Searching | TrackingMode::Homing, _) if self.state.home_pending() => {
                    (GoalSource::Home, self.mapper.home().to_vec())
                }
                _ => (GoalSource::None, Vec::new()),
            }
        };

        let mut commanded = false;
        if !goals.is_empty() {
            match self.bus.set_goal_positions(&goals) {
                Ok(()) => {
                    commanded = true;
                    if goal_source == GoalSource::Home {
                        if let Some(from) = self.state.home_sent() {
                            info!("Home commanded, {} -> {}", from, self.state.mode);
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping goal command this cycle: {}", e);
                    errors.push(e.to_string());
                }
            }
        }

        let report = CycleReport {
            cycle: self.cycles,
            mode: self.state.mode,
            observation,
            estimate,
            goal_source,
            goals,
            commanded,
            present_positions,
            errors,
        };
        // No subscribers is fine
        let _ = self.status.send(report.clone());
        report
    }

    /// Drive cycles from `source` until a stop command or a perception
    /// failure. The loop always ends with [`ControlLoop::shutdown`].
    ///
    /// Bus transactions block the calling task for at most the bus deadline.
    pub async fn run<S: PerceptionSource + ?Sized>(mut self, source: &mut S) -> Result<T> {
        info!(
            "Control loop running on {} with perception source {}",
            self.bus.transport().name(),
            source.name()
        );

        let outcome = loop {
            let frame_timeout = self.config.tracking.frame_timeout();
            tokio::select! {
                biased;

                command = self.commands_rx.recv() => match command {
                    Some(ControlCommand::Stop) | None => {
                        info!("Stop requested");
                        break Ok(());
                    }
                    Some(ControlCommand::UpdateConfig(config)) => {
                        if let Err(e) = self.update_config(*config) {
                            warn!("Rejected configuration update: {}", e);
                        }
                    }
                    Some(ControlCommand::Operator(input)) => {
                        self.operator_input(input, Instant::now());
                    }
                },

                frame = tokio::time::timeout(frame_timeout, source.next_frame()) => match frame {
                    Ok(Ok(frame)) => {
                        self.cycle(Some(&frame), Instant::now());
                    }
                    Ok(Err(e)) => {
                        error!("Perception source {} failed: {}", source.name(), e);
                        break Err(e);
                    }
                    Err(_) => {
                        debug!("No frame within {:?}", frame_timeout);
                        self.cycle(None, Instant::now());
                    }
                },
            }
        };

        let transport = self.shutdown();
        outcome.map(|()| transport)
    }

    /// Disable torque on every axis and release the bus
    pub fn shutdown(mut self) -> T {
        for id in self.config.axis_ids() {
            if let Err(e) = self.bus.set_torque(id, false) {
                warn!(id, "Failed to disable torque: {}", e);
            }
        }
        info!("Torque disabled, bus released after {} cycles", self.cycles);
        self.bus.into_transport()
    }
}
