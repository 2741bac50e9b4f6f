//! Per-frame target selection

use serde::Serialize;
use wingman_core::{ConsoleSettings, FusionMode, Frame, Point2, TrackingConfig};
use tracing::{debug, trace};

/// The authoritative target chosen for one frame, in normalized image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Fiducial { id: i32, centroid: Point2 },
    Detection { label: i32, confidence: f32, centroid: Point2 },
    None,
}

impl Observation {
    pub fn centroid(&self) -> Option<Point2> {
        match self {
            Observation::Fiducial { centroid, .. } | Observation::Detection { centroid, .. } => {
                Some(*centroid)
            }
            Observation::None => None,
        }
    }

    pub fn is_some(&self) -> bool {
        !matches!(self, Observation::None)
    }
}

/// Parameters of the selection policy
#[derive(Debug, Clone, PartialEq)]
pub struct FusionPolicy {
    pub mode: FusionMode,
    pub confidence_threshold: f32,
    pub target_label: Option<i32>,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl Default for FusionPolicy {
    fn default() -> Self {
        Self::from_config(&ConsoleSettings::default(), &TrackingConfig::default())
    }
}

impl FusionPolicy {
    pub fn from_config(console: &ConsoleSettings, tracking: &TrackingConfig) -> Self {
        Self {
            mode: tracking.fusion_mode,
            confidence_threshold: console.confidence_threshold,
            target_label: tracking.target_label,
            flip_horizontal: console.flip_horizontal,
            flip_vertical: console.flip_vertical,
        }
    }

    /// Choose the target for a frame.
    ///
    /// The first fiducial wins over any generic detection. Otherwise the most
    /// confident detection at or above the threshold is used.
    pub fn select(&self, frame: &Frame) -> Observation {
        let observation = match self.mode {
            FusionMode::FiducialPriority => {
                let fiducial = self.select_fiducial(frame);
                if fiducial.is_some() {
                    fiducial
                } else {
                    self.select_detection(frame)
                }
            }
            FusionMode::FiducialOnly => self.select_fiducial(frame),
            FusionMode::DetectionsOnly => self.select_detection(frame),
        };
        trace!(?observation, "fused observation");
        self.flip(observation)
    }

    fn select_fiducial(&self, frame: &Frame) -> Observation {
        let Some(tag) = frame.fiducials.first() else {
            return Observation::None;
        };
        match frame.normalize(tag.pixel_centroid()) {
            Some(centroid) if centroid.is_finite() => Observation::Fiducial { id: tag.id, centroid },
            _ => {
                debug!(tag = tag.id, "fiducial in a frame without usable dimensions");
                Observation::None
            }
        }
    }

    fn select_detection(&self, frame: &Frame) -> Observation {
        frame
            .detections
            .iter()
            .filter(|d| d.is_finite() && d.confidence >= self.confidence_threshold)
            .filter(|d| self.target_label.map_or(true, |label| d.label == label))
            .fold(None, |best: Option<&wingman_core::Detection>, d| match best {
                Some(b) if b.confidence >= d.confidence => Some(b),
                _ => Some(d),
            })
            .map_or(Observation::None, |d| Observation::Detection {
                label: d.label,
                confidence: d.confidence,
                centroid: d.centroid(),
            })
    }

    fn flip(&self, observation: Observation) -> Observation {
        let flip_point = |p: Point2| {
            Point2::new(
                if self.flip_horizontal { 1.0 - p.x } else { p.x },
                if self.flip_vertical { 1.0 - p.y } else { p.y },
            )
        };
        match observation {
            Observation::Fiducial { id, centroid } => Observation::Fiducial {
                id,
                centroid: flip_point(centroid),
            },
            Observation::Detection { label, confidence, centroid } => Observation::Detection {
                label,
                confidence,
                centroid: flip_point(centroid),
            },
            Observation::None => Observation::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wingman_core::{Detection, FiducialDetection};

    fn tag(id: i32, cx: f64, cy: f64) -> FiducialDetection {
        FiducialDetection::new(
            id,
            [
                [cx - 10.0, cy - 10.0],
                [cx + 10.0, cy - 10.0],
                [cx + 10.0, cy + 10.0],
                [cx - 10.0, cy + 10.0],
            ],
        )
    }

    #[test]
    fn test_empty_frame() {
        let policy = FusionPolicy::default();
        assert_eq!(policy.select(&Frame::new(640, 480)), Observation::None);
    }

    #[test]
    fn test_highest_confidence_wins() {
        let frame = Frame::new(640, 480).with_detections(vec![
            Detection::new(0, 0.6, 0.0, 0.0, 0.2, 0.2),
            Detection::new(0, 0.9, 0.6, 0.6, 0.8, 0.8),
            Detection::new(0, 0.7, 0.4, 0.4, 0.6, 0.6),
        ]);
        match FusionPolicy::default().select(&frame) {
            Observation::Detection { confidence, centroid, .. } => {
                assert_eq!(confidence, 0.9);
                assert!((centroid.x - 0.7).abs() < 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let frame =
            Frame::new(640, 480).with_detections(vec![Detection::new(0, 0.5, 0.0, 0.0, 1.0, 1.0)]);
        assert!(FusionPolicy::default().select(&frame).is_some());

        let frame =
            Frame::new(640, 480).with_detections(vec![Detection::new(0, 0.49, 0.0, 0.0, 1.0, 1.0)]);
        assert_eq!(FusionPolicy::default().select(&frame), Observation::None);
    }

    #[test]
    fn test_first_fiducial_is_used() {
        let frame = Frame::new(640, 480).with_fiducials(vec![tag(4, 320.0, 240.0), tag(9, 64.0, 48.0)]);
        assert_eq!(
            FusionPolicy::default().select(&frame),
            Observation::Fiducial { id: 4, centroid: Point2::new(0.5, 0.5) }
        );
    }

    #[test]
    fn test_target_label_filter() {
        let mut policy = FusionPolicy::default();
        policy.target_label = Some(0);
        let frame = Frame::new(640, 480).with_detections(vec![
            Detection::new(15, 0.95, 0.0, 0.0, 0.2, 0.2),
            Detection::new(0, 0.55, 0.4, 0.4, 0.6, 0.6),
        ]);
        match policy.select(&frame) {
            Observation::Detection { label, .. } => assert_eq!(label, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fusion_modes() {
        let frame = Frame::new(640, 480)
            .with_fiducials(vec![tag(1, 320.0, 240.0)])
            .with_detections(vec![Detection::new(0, 0.99, 0.0, 0.0, 0.2, 0.2)]);

        let mut policy = FusionPolicy::default();
        policy.mode = FusionMode::DetectionsOnly;
        assert!(matches!(policy.select(&frame), Observation::Detection { .. }));

        policy.mode = FusionMode::FiducialOnly;
        let detections_only = Frame::new(640, 480)
            .with_detections(vec![Detection::new(0, 0.99, 0.0, 0.0, 0.2, 0.2)]);
        assert_eq!(policy.select(&detections_only), Observation::None);
    }

    #[test]
    fn test_flip() {
        let mut policy = FusionPolicy::default();
        policy.flip_horizontal = true;
        let frame =
            Frame::new(640, 480).with_detections(vec![Detection::new(0, 0.8, 0.1, 0.1, 0.3, 0.5)]);
        let centroid = policy.select(&frame).centroid().unwrap();
        assert!((centroid.x - 0.8).abs() < 1e-12);
        assert!((centroid.y - 0.3).abs() < 1e-12);

        policy.flip_vertical = true;
        let centroid = policy.select(&frame).centroid().unwrap();
        assert!((centroid.y - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_fiducial_in_dimensionless_frame_is_ignored() {
        let frame = Frame::new(0, 0)
            .with_fiducials(vec![tag(1, 10.0, 10.0)])
            .with_detections(vec![Detection::new(0, 0.9, 0.4, 0.4, 0.6, 0.6)]);
        assert!(matches!(
            FusionPolicy::default().select(&frame),
            Observation::Detection { .. }
        ));
    }
}
