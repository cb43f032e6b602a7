//! Per-frame detection and localization.

pub mod decode;
pub mod localize;
pub mod nms;
pub mod otsu;
pub mod pipeline;

use tof_common::Point2D;

pub use pipeline::DetectionPipeline;

/// Integer pixel rectangle, `x`/`y` at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> i64 {
        if self.width <= 0 || self.height <= 0 {
            0
        } else {
            i64::from(self.width) * i64::from(self.height)
        }
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        Rect::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
    }

    /// Intersection over union; 0 when both rectangles are empty.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection(other).area();
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

/// A decoded detector row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub confidence: f32,
    pub rect: Rect,
}

/// Closest surface found in one ROI column, in sensor meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorPoint {
    /// Pixel position in the full frame.
    pub row: usize,
    pub col: usize,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub depth: f32,
}

/// One surviving detection with its localized points.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub class_id: i32,
    pub confidence: f32,
    pub rect: Rect,
    pub threshold: u8,
    pub points: Vec<SensorPoint>,
    /// `points` in the robot frame, same order.
    pub robot_points: Vec<Point2D>,
}
