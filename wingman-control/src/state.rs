//! Search / track / home state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use wingman_core::Point2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// No recent target; axes held at home
    Searching,
    /// Following a fused target
    Tracking,
    /// Target lost, returning home
    Homing,
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingMode::Searching => write!(f, "searching"),
            TrackingMode::Tracking => write!(f, "tracking"),
            TrackingMode::Homing => write!(f, "homing"),
        }
    }
}

/// Per-session control state; never persisted
#[derive(Debug, Clone)]
pub struct ControlState {
    pub mode: TrackingMode,
    pub last_detection_time: Option<Instant>,
    pub last_valid_centroid: Option<Point2>,
    home_pending: bool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlState {
    /// Starts searching with a home command outstanding
    pub fn new() -> Self {
        Self {
            mode: TrackingMode::Searching,
            last_detection_time: None,
            last_valid_centroid: None,
            home_pending: true,
        }
    }

    /// Record a valid observation. Returns the previous mode when this
    /// changed the mode.
    pub fn on_observation(&mut self, now: Instant) -> Option<TrackingMode> {
        self.last_detection_time = Some(now);
        self.home_pending = false;
        self.transition(TrackingMode::Tracking)
    }

    /// Leave tracking once no observation arrived for longer than `timeout`.
    /// Returns true on the transition.
    pub fn check_timeout(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.mode != TrackingMode::Tracking {
            return false;
        }
        let expired = self
            .last_detection_time
            .map_or(true, |t| now.saturating_duration_since(t) > timeout);
        if expired {
            self.transition(TrackingMode::Homing);
            self.last_valid_centroid = None;
            self.home_pending = true;
        }
        expired
    }

    pub fn home_pending(&self) -> bool {
        self.home_pending
    }

    /// Ask for the home command to be (re)sent
    pub fn request_home(&mut self) {
        if self.mode != TrackingMode::Tracking {
            self.home_pending = true;
        }
    }

    /// The home command reached the bus
    pub fn home_sent(&mut self) -> Option<TrackingMode> {
        self.home_pending = false;
        if self.mode == TrackingMode::Homing {
            self.transition(TrackingMode::Searching)
        } else {
            None
        }
    }

    fn transition(&mut self, to: TrackingMode) -> Option<TrackingMode> {
        if self.mode == to {
            return None;
        }
        let from = self.mode;
        self.mode = to;
        Some(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_initial_state() {
        let state = ControlState::new();
        assert_eq!(state.mode, TrackingMode::Searching);
        assert!(state.home_pending());
        assert!(state.last_detection_time.is_none());
    }

    #[test]
    fn test_observation_starts_tracking() {
        let mut state = ControlState::new();
        let t0 = Instant::now();
        assert_eq!(state.on_observation(t0), Some(TrackingMode::Searching));
        assert_eq!(state.mode, TrackingMode::Tracking);
        assert!(!state.home_pending());
        assert_eq!(state.on_observation(t0 + Duration::from_millis(30)), None);
    }

    #[test]
    fn test_timeout_is_strict() {
        let mut state = ControlState::new();
        let t0 = Instant::now();
        state.on_observation(t0);
        assert!(!state.check_timeout(t0 + TIMEOUT, TIMEOUT));
        assert_eq!(state.mode, TrackingMode::Tracking);
        assert!(state.check_timeout(t0 + TIMEOUT + Duration::from_millis(1), TIMEOUT));
        assert_eq!(state.mode, TrackingMode::Homing);
        assert!(state.home_pending());
    }

    #[test]
    fn test_home_sent_finishes_homing() {
        let mut state = ControlState::new();
        let t0 = Instant::now();
        state.on_observation(t0);
        state.check_timeout(t0 + Duration::from_secs(6), TIMEOUT);
        assert_eq!(state.home_sent(), Some(TrackingMode::Homing));
        assert_eq!(state.mode, TrackingMode::Searching);
        assert!(!state.home_pending());
    }

    #[test]
    fn test_reacquire_while_homing() {
        let mut state = ControlState::new();
        let t0 = Instant::now();
        state.on_observation(t0);
        state.check_timeout(t0 + Duration::from_secs(6), TIMEOUT);
        assert_eq!(
            state.on_observation(t0 + Duration::from_secs(7)),
            Some(TrackingMode::Homing)
        );
        assert_eq!(state.mode, TrackingMode::Tracking);
    }

    #[test]
    fn test_request_home_ignored_while_tracking() {
        let mut state = ControlState::new();
        state.on_observation(Instant::now());
        state.request_home();
        assert!(!state.home_pending());
    }
}
