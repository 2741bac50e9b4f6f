//! Constant-velocity target estimator
//!
//! State vector: [x, y, vx, vy] in normalized image units (velocity per second)
//! Measurement: [x, y]
//!
//! The filter velocity is the only velocity in the system; nothing downstream
//! differences positions on its own.

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, warn};
use wingman_core::{ConsoleSettings, Point2, TrackingConfig};

/// Initial position variance of a freshly seeded track
const INITIAL_POSITION_VARIANCE: f64 = 1.0;
/// Initial velocity variance of a freshly seeded track
const INITIAL_VELOCITY_VARIANCE: f64 = 10.0;
/// Longest step the motion model will extrapolate in one go
const MAX_STEP_SECS: f64 = 1.0;

/// Snapshot of the tracked target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackEstimate {
    pub position: Point2,
    /// Zero until two consecutive observations have been fused
    pub velocity: Point2,
    /// Row-major 4x4 state covariance
    pub covariance: [[f64; 4]; 4],
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

/// Where an emitted centroid came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    /// Filter posterior after fusing an observation
    Observed,
    /// Motion-model extrapolation without an observation
    Predicted,
    /// Prediction left the sanity region; last valid centroid held
    Frozen,
}

/// Output of one estimator step
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EstimateOutput {
    pub centroid: Point2,
    pub velocity: Option<Point2>,
    pub source: EstimateSource,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorParams {
    /// Acceleration variance of the motion model
    pub process_noise: f64,
    /// Position variance of one observation
    pub measurement_noise: f64,
    pub sanity_min: Point2,
    pub sanity_max: Point2,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self::from_config(&ConsoleSettings::default(), &TrackingConfig::default())
    }
}

impl EstimatorParams {
    pub fn from_config(console: &ConsoleSettings, tracking: &TrackingConfig) -> Self {
        Self {
            process_noise: console.process_noise,
            measurement_noise: console.measurement_noise,
            sanity_min: tracking.sanity_min,
            sanity_max: tracking.sanity_max,
        }
    }

    pub fn in_bounds(&self, p: Point2) -> bool {
        p.is_finite()
            && p.x >= self.sanity_min.x
            && p.x <= self.sanity_max.x
            && p.y >= self.sanity_min.y
            && p.y <= self.sanity_max.y
    }
}

struct Kalman {
    x: Vector4<f64>,
    p: Matrix4<f64>,
    h: Matrix2x4<f64>,
}

impl Kalman {
    fn new(position: Point2) -> Self {
        let mut p = Matrix4::identity() * INITIAL_POSITION_VARIANCE;
        p[(2, 2)] = INITIAL_VELOCITY_VARIANCE;
        p[(3, 3)] = INITIAL_VELOCITY_VARIANCE;
        Self {
            x: Vector4::new(position.x, position.y, 0.0, 0.0),
            p,
            h: Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0),
        }
    }

    fn predict(&mut self, dt: f64, process_noise: f64) {
        let f = Matrix4::new(
            1.0, 0.0, dt, 0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        // Discrete white-noise acceleration
        let dt2 = dt * dt;
        let dt3 = dt2 * dt / 2.0;
        let dt4 = dt2 * dt2 / 4.0;
        let q = Matrix4::new(
            dt4, 0.0, dt3, 0.0,
            0.0, dt4, 0.0, dt3,
            dt3, 0.0, dt2, 0.0,
            0.0, dt3, 0.0, dt2,
        ) * process_noise;

        self.x = f * self.x;
        self.p = f * self.p * f.transpose() + q;
    }

    fn update(&mut self, z: Point2, measurement_noise: f64) {
        let z = Vector2::new(z.x, z.y);
        let r = Matrix2::identity() * measurement_noise;
        let y = z - self.h * self.x;
        let s = self.h * self.p * self.h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            warn!("Singular innovation covariance, skipping correction");
            return;
        };
        let k: Matrix4x2<f64> = self.p * self.h.transpose() * s_inv;
        self.x += k * y;
        self.p = (Matrix4::identity() - k * self.h) * self.p;
    }

    /// Hold the target at `position` with no motion
    fn anchor(&mut self, position: Point2) {
        self.x = Vector4::new(position.x, position.y, 0.0, 0.0);
    }

    fn position(&self) -> Point2 {
        Point2::new(self.x[0], self.x[1])
    }

    fn velocity(&self) -> Point2 {
        Point2::new(self.x[2], self.x[3])
    }
}

/// One estimator per tracking session
pub struct TargetEstimator {
    params: EstimatorParams,
    kalman: Option<Kalman>,
    last_step: Option<Instant>,
    last_update: Option<Instant>,
    consecutive_observations: u32,
    velocity_valid: bool,
    last_valid: Option<Point2>,
}

impl TargetEstimator {
    pub fn new(params: EstimatorParams) -> Self {
        Self {
            params,
            kalman: None,
            last_step: None,
            last_update: None,
            consecutive_observations: 0,
            velocity_valid: false,
            last_valid: None,
        }
    }

    pub fn params(&self) -> &EstimatorParams {
        &self.params
    }

    /// Swap noise and bounds; the track itself is kept
    pub fn set_params(&mut self, params: EstimatorParams) {
        self.params = params;
    }

    pub fn is_tracking(&self) -> bool {
        self.kalman.is_some()
    }

    /// Forget the track
    pub fn reset(&mut self) {
        debug!("Estimator reset");
        self.kalman = None;
        self.last_step = None;
        self.last_update = None;
        self.consecutive_observations = 0;
        self.velocity_valid = false;
        self.last_valid = None;
    }

    pub fn last_valid_centroid(&self) -> Option<Point2> {
        self.last_valid
    }

    /// Filter velocity, once two consecutive observations have been fused
    pub fn velocity(&self) -> Option<Point2> {
        match &self.kalman {
            Some(k) if self.velocity_valid => Some(k.velocity()),
            _ => None,
        }
    }

    pub fn estimate(&self) -> Option<TrackEstimate> {
        let k = self.kalman.as_ref()?;
        let mut covariance = [[0.0; 4]; 4];
        for (r, row) in covariance.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = k.p[(r, c)];
            }
        }
        Some(TrackEstimate {
            position: k.position(),
            velocity: self.velocity().unwrap_or_default(),
            covariance,
            last_update: self.last_update,
        })
    }

    /// Advance to `now`, fusing `observation` if there is one.
    ///
    /// Returns `None` while no track exists. A position outside the sanity
    /// region is never emitted; the last valid centroid is held instead and
    /// the filter is re-anchored there.
    pub fn step(&mut self, observation: Option<Point2>, now: Instant) -> Option<EstimateOutput> {
        let observation = observation.filter(|p| p.is_finite());
        let dt = self
            .last_step
            .map(|t| now.saturating_duration_since(t).as_secs_f64().min(MAX_STEP_SECS))
            .unwrap_or(0.0);
        self.last_step = Some(now);

        if self.kalman.is_none() {
            let z = observation?;
            debug!(x = z.x, y = z.y, "Seeding track");
            self.kalman = Some(Kalman::new(z));
        }
        let kalman = self.kalman.as_mut()?;

        kalman.predict(dt, self.params.process_noise);
        let source = match observation {
            Some(z) => {
                kalman.update(z, self.params.measurement_noise);
                self.consecutive_observations += 1;
                if self.consecutive_observations >= 2 {
                    self.velocity_valid = true;
                }
                self.last_update = Some(now);
                EstimateSource::Observed
            }
            None => {
                self.consecutive_observations = 0;
                EstimateSource::Predicted
            }
        };

        let candidate = kalman.position();
        if self.params.in_bounds(candidate) {
            self.last_valid = Some(candidate);
            return Some(EstimateOutput {
                centroid: candidate,
                velocity: self.velocity(),
                source,
            });
        }

        let held = match self.last_valid {
            Some(p) => p,
            // Seeded from an out-of-bounds observation: clamp into the region
            None => Point2::new(
                candidate.x.clamp(self.params.sanity_min.x, self.params.sanity_max.x),
                candidate.y.clamp(self.params.sanity_min.y, self.params.sanity_max.y),
            ),
        };
        debug!(
            x = candidate.x,
            y = candidate.y,
            "Estimate outside sanity bounds, holding last valid centroid"
        );
        kalman.anchor(held);
        self.last_valid = Some(held);
        Some(EstimateOutput {
            centroid: held,
            velocity: self.velocity(),
            source: EstimateSource::Frozen,
        })
    }
}
