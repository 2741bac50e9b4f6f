//! Perception data model consumed by the tracker

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A point in the image plane.
///
/// Normalized points live in `[0, 1]` on both axes with the origin at the
/// top-left corner; pixel points use the frame's own dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Generic object detection with a normalized bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: i32,
    pub confidence: f32,
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Detection {
    pub fn new(label: i32, confidence: f32, xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { label, confidence, xmin, ymin, xmax, ymax }
    }

    /// Bounding box midpoint
    pub fn centroid(&self) -> Point2 {
        Point2::new((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.confidence.is_finite()
            && self.xmin.is_finite()
            && self.ymin.is_finite()
            && self.xmax.is_finite()
            && self.ymax.is_finite()
    }
}

/// Fiducial marker detection, corners in pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiducialDetection {
    pub id: i32,
    pub corners: [[f64; 2]; 4],
}

impl FiducialDetection {
    pub fn new(id: i32, corners: [[f64; 2]; 4]) -> Self {
        Self { id, corners }
    }

    /// Mean of the four corners, in pixels
    pub fn pixel_centroid(&self) -> Point2 {
        let (sx, sy) = self
            .corners
            .iter()
            .fold((0.0, 0.0), |(sx, sy), [x, y]| (sx + x, sy + y));
        Point2::new(sx / 4.0, sy / 4.0)
    }
}

/// One frame from the perception source together with everything detected in it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Raw pixel buffer; the control loop never inspects it
    #[serde(skip)]
    pub image: Bytes,
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub fiducials: Vec<FiducialDetection>,
}

impl Frame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }

    pub fn with_fiducials(mut self, fiducials: Vec<FiducialDetection>) -> Self {
        self.fiducials = fiducials;
        self
    }

    /// Convert a pixel-space point into normalized image coordinates.
    /// Returns `None` for a frame without dimensions.
    pub fn normalize(&self, point: Point2) -> Option<Point2> {
        if self.width == 0 || self.height == 0 {
            return None;
        }
        Some(Point2::new(
            point.x / self.width as f64,
            point.y / self.height as f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_centroid() {
        let det = Detection::new(0, 0.9, 0.2, 0.4, 0.6, 0.8);
        let c = det.centroid();
        assert!((c.x - 0.4).abs() < 1e-12);
        assert!((c.y - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_fiducial_pixel_centroid() {
        let tag = FiducialDetection::new(
            7,
            [[300.0, 220.0], [340.0, 220.0], [340.0, 260.0], [300.0, 260.0]],
        );
        assert_eq!(tag.pixel_centroid(), Point2::new(320.0, 240.0));
    }

    #[test]
    fn test_frame_normalize() {
        let frame = Frame::new(640, 480);
        assert_eq!(
            frame.normalize(Point2::new(320.0, 240.0)),
            Some(Point2::new(0.5, 0.5))
        );
        assert_eq!(Frame::new(0, 480).normalize(Point2::new(1.0, 1.0)), None);
    }

    #[test]
    fn test_frame_json_schema() {
        let json = r#"{
            "width": 640,
            "height": 480,
            "detections": [{"label": 0, "confidence": 0.8, "xmin": 0.1, "ymin": 0.1, "xmax": 0.3, "ymax": 0.5}],
            "fiducials": [{"id": 3, "corners": [[0,0],[10,0],[10,10],[0,10]]}]
        }"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.detections.len(), 1);
        assert_eq!(frame.fiducials[0].id, 3);
        assert!(frame.image.is_empty());
    }

    #[test]
    fn test_frame_missing_lists_default_to_empty() {
        let frame: Frame = serde_json::from_str(r#"{"width": 640, "height": 480}"#).unwrap();
        assert!(frame.detections.is_empty());
        assert!(frame.fiducials.is_empty());
    }
}
