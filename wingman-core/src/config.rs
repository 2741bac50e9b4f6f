//! Session configuration
//!
//! Two layers: [`ConsoleSettings`] is the flat key/value surface exposed to
//! the operator console and persisted as a JSON object, [`SessionConfig`]
//! bundles it with axis, bus, tracking and teleoperation parameters and is
//! loaded from TOML. The control loop receives a `SessionConfig` by value
//! and only swaps it between cycles.

use crate::axis::{AxisConfig, AxisRole};
use crate::error::{Error, Result};
use crate::types::Point2;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Operator console settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Mirror observations left/right
    pub flip_horizontal: bool,
    /// Mirror observations top/bottom
    pub flip_vertical: bool,
    /// Minimum confidence for generic detections
    pub confidence_threshold: f32,
    /// Multiplier applied to mapped goals, 0..=1
    pub servo_scale: f64,
    /// Lead extrapolation in seconds
    pub lead_time: f64,
    /// Estimator process noise (acceleration variance)
    pub process_noise: f64,
    /// Estimator measurement noise (position variance, normalized units)
    pub measurement_noise: f64,
    pub reverse_pan: bool,
    pub reverse_tilt: bool,
    /// Goal speed for both axes; 0 keeps the per-axis speed
    pub servo_speed: u32,
    /// Whether a preview window should be shown by the perception side
    pub show_frame: bool,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            flip_horizontal: false,
            flip_vertical: false,
            confidence_threshold: 0.5,
            servo_scale: 1.0,
            lead_time: 0.0,
            process_noise: 1.0,
            measurement_noise: 1e-4,
            reverse_pan: false,
            reverse_tilt: false,
            servo_speed: 0,
            show_frame: false,
        }
    }
}

impl ConsoleSettings {
    /// Recognized keys, in document order
    pub const KEYS: [&'static str; 11] = [
        "flip_horizontal",
        "flip_vertical",
        "confidence_threshold",
        "servo_scale",
        "lead_time",
        "process_noise",
        "measurement_noise",
        "reverse_pan",
        "reverse_tilt",
        "servo_speed",
        "show_frame",
    ];

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::Configuration(
                "confidence_threshold must be between 0 and 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.servo_scale) {
            return Err(Error::Configuration(
                "servo_scale must be between 0 and 1".to_string(),
            ));
        }

        if !self.lead_time.is_finite() || self.lead_time < 0.0 {
            return Err(Error::Configuration(
                "lead_time must be a non-negative number of seconds".to_string(),
            ));
        }

        if !self.process_noise.is_finite() || self.process_noise <= 0.0 {
            return Err(Error::Configuration(
                "process_noise must be positive".to_string(),
            ));
        }

        if !self.measurement_noise.is_finite() || self.measurement_noise <= 0.0 {
            return Err(Error::Configuration(
                "measurement_noise must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse a flat JSON document. Unknown keys are ignored, duplicate keys
    /// resolve to the last value, and a key with a value of the wrong type
    /// keeps its default.
    pub fn from_json_str(content: &str) -> Result<Self> {
        Self::default().overlay_json_str(content)
    }

    /// Apply the keys of a flat JSON document on top of these settings.
    /// Keys missing from the document keep their current value.
    pub fn overlay_json_str(&self, content: &str) -> Result<Self> {
        let map: Map<String, Value> = serde_json::from_str(content)?;
        let mut settings = self.clone();
        for (key, value) in &map {
            if let Err(e) = settings.apply(key, value) {
                warn!("Ignoring setting '{}': {}", key, e);
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings, recovering from any problem with the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::default().load_over(path)
    }

    /// Load settings on top of `self`. A missing, unreadable or malformed
    /// file leaves `self` unchanged.
    pub fn load_over(&self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No settings at {}, keeping configured values", path.display());
                return self.clone();
            }
            Err(e) => {
                warn!("Failed to read settings {}: {}, keeping configured values", path.display(), e);
                return self.clone();
            }
        };

        match self.overlay_json_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Malformed settings {}: {}, keeping configured values", path.display(), e);
                self.clone()
            }
        }
    }

    /// Persist as a flat JSON object
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Set one key from its JSON value
    pub fn apply(&mut self, key: &str, value: &Value) -> Result<()> {
        let bad = || Error::Parse(format!("invalid value {} for '{}'", value, key));
        match key {
            "flip_horizontal" => self.flip_horizontal = value.as_bool().ok_or_else(bad)?,
            "flip_vertical" => self.flip_vertical = value.as_bool().ok_or_else(bad)?,
            "confidence_threshold" => {
                self.confidence_threshold = value.as_f64().ok_or_else(bad)? as f32
            }
            "servo_scale" => self.servo_scale = value.as_f64().ok_or_else(bad)?,
            "lead_time" => self.lead_time = value.as_f64().ok_or_else(bad)?,
            "process_noise" => self.process_noise = value.as_f64().ok_or_else(bad)?,
            "measurement_noise" => self.measurement_noise = value.as_f64().ok_or_else(bad)?,
            "reverse_pan" => self.reverse_pan = value.as_bool().ok_or_else(bad)?,
            "reverse_tilt" => self.reverse_tilt = value.as_bool().ok_or_else(bad)?,
            "servo_speed" => {
                self.servo_speed = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(bad)?
            }
            "show_frame" => self.show_frame = value.as_bool().ok_or_else(bad)?,
            _ => return Err(Error::UnknownSetting(key.to_string())),
        }
        Ok(())
    }

    /// Set one key from text, e.g. from the command line.
    /// Accepts `0`/`1` for booleans the way slider-style consoles report them.
    pub fn set(&mut self, key: &str, text: &str) -> Result<()> {
        let text = text.trim();
        let value = match text {
            "0" | "false" | "off" if self.is_bool_key(key) => Value::Bool(false),
            "1" | "true" | "on" if self.is_bool_key(key) => Value::Bool(true),
            _ => serde_json::from_str(text)
                .map_err(|_| Error::Parse(format!("invalid value '{}' for '{}'", text, key)))?,
        };

        let mut updated = self.clone();
        updated.apply(key, &value)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    fn is_bool_key(&self, key: &str) -> bool {
        matches!(
            key,
            "flip_horizontal" | "flip_vertical" | "reverse_pan" | "reverse_tilt" | "show_frame"
        )
    }
}

/// How the fusion step chooses between fiducials and generic detections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Fiducials when present, otherwise the best generic detection
    FiducialPriority,
    FiducialOnly,
    DetectionsOnly,
}

impl Default for FusionMode {
    fn default() -> Self {
        FusionMode::FiducialPriority
    }
}

/// Control-loop timing and estimator bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Seconds without an observation before the mount returns home
    pub detection_timeout_secs: f64,
    /// Longest wait for one frame from the perception source
    pub frame_timeout_ms: u64,
    /// Lower corner of the valid prediction region (normalized)
    pub sanity_min: Point2,
    /// Upper corner of the valid prediction region (normalized)
    pub sanity_max: Point2,
    /// Read present positions every N cycles, 0 disables
    pub telemetry_interval: u32,
    pub fusion_mode: FusionMode,
    /// Only follow generic detections with this label
    pub target_label: Option<i32>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            detection_timeout_secs: 5.0,
            frame_timeout_ms: 1000,
            sanity_min: Point2::new(0.0, 0.0),
            sanity_max: Point2::new(1.0, 1.0),
            telemetry_interval: 10,
            fusion_mode: FusionMode::FiducialPriority,
            target_label: None,
        }
    }
}

impl TrackingConfig {
    pub fn detection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.detection_timeout_secs.max(0.0))
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Serial bus parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub port: String,
    pub baudrate: u32,
    /// Deadline for one bus transaction
    pub timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyDXL".to_string(),
            baudrate: 1_000_000,
            timeout_ms: 20,
        }
    }
}

impl BusSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Gamepad teleoperation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    /// Stick magnitude treated as centred
    pub dead_zone: i16,
    /// Position steps per cycle at full pan deflection
    pub pan_sensitivity: f64,
    /// Position steps per cycle at full tilt deflection
    pub tilt_sensitivity: f64,
    /// Invert the tilt stick
    pub invert_tilt: bool,
    /// How long injected goals stay in effect after the last input
    pub hold_ms: u64,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            dead_zone: 6000,
            pan_sensitivity: 600.0,
            tilt_sensitivity: 200.0,
            invert_tilt: true,
            hold_ms: 1000,
        }
    }
}

impl TeleopConfig {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

/// Everything the control loop needs for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub console: ConsoleSettings,
    pub pan: AxisConfig,
    pub tilt: AxisConfig,
    pub tracking: TrackingConfig,
    pub bus: BusSettings,
    pub teleop: TeleopConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            console: ConsoleSettings::default(),
            pan: AxisConfig::default_pan(),
            tilt: AxisConfig::default_tilt(),
            tracking: TrackingConfig::default(),
            bus: BusSettings::default(),
            teleop: TeleopConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Parse(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.console.validate()?;
        self.pan.validate()?;
        self.tilt.validate()?;

        if self.pan.id == self.tilt.id {
            return Err(Error::Configuration(format!(
                "pan and tilt share bus id {}",
                self.pan.id
            )));
        }

        let t = &self.tracking;
        if !t.detection_timeout_secs.is_finite() || t.detection_timeout_secs <= 0.0 {
            return Err(Error::Configuration(
                "detection_timeout_secs must be positive".to_string(),
            ));
        }

        if t.frame_timeout_ms == 0 {
            return Err(Error::Configuration(
                "frame_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !(t.sanity_min.is_finite() && t.sanity_max.is_finite())
            || t.sanity_min.x >= t.sanity_max.x
            || t.sanity_min.y >= t.sanity_max.y
        {
            return Err(Error::Configuration(
                "sanity bounds must describe a non-empty region".to_string(),
            ));
        }

        if self.bus.baudrate == 0 {
            return Err(Error::Configuration("baudrate must be non-zero".to_string()));
        }

        if self.bus.timeout_ms == 0 {
            return Err(Error::Configuration(
                "bus timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.teleop.dead_zone < 0 {
            return Err(Error::Configuration(
                "teleop dead_zone must not be negative".to_string(),
            ));
        }

        Ok(())
    }

    pub fn axis(&self, role: AxisRole) -> &AxisConfig {
        match role {
            AxisRole::Pan => &self.pan,
            AxisRole::Tilt => &self.tilt,
        }
    }

    /// Pan and tilt, in that order
    pub fn axes(&self) -> [(AxisRole, &AxisConfig); 2] {
        [(AxisRole::Pan, &self.pan), (AxisRole::Tilt, &self.tilt)]
    }

    pub fn axis_ids(&self) -> [u8; 2] {
        [self.pan.id, self.tilt.id]
    }

    /// Goal speed to configure on an axis; the console value wins when set
    pub fn speed_for(&self, role: AxisRole) -> u32 {
        if self.console.servo_speed > 0 {
            self.console.servo_speed
        } else {
            self.axis(role).speed
        }
    }

    /// Session-level inversion flag for an axis
    pub fn reverse_for(&self, role: AxisRole) -> bool {
        match role {
            AxisRole::Pan => self.console.reverse_pan,
            AxisRole::Tilt => self.console.reverse_tilt,
        }
    }
}
