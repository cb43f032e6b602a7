use serde::{Deserialize, Serialize};

/// Obstacle point in the robot's planar navigation (LDS) frame, in millimeters.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point2D {
    pub x: i32,
    pub y: i32,
}

impl Point2D {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Marks where one detected object's points end inside a published point list.
///
/// Objects are stored in the same order as their points, so the first point of
/// object `n` is `objects[n - 1].last_index + 1` (or 0 for the first object).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ObjectId {
    pub class_id: u8,
    pub last_index: u32,
}

impl ObjectId {
    pub fn new(class_id: u8, last_index: u32) -> Self {
        Self {
            class_id,
            last_index,
        }
    }
}
