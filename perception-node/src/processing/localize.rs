use ndarray::{s, ArrayView2};

use super::{Rect, SensorPoint};
use crate::camera::Frame;

/// Depth window for a pixel to count as an obstacle surface.
#[derive(Debug, Clone, Copy)]
pub struct DepthWindow {
    /// Exclusive lower bound; filters sensor noise near zero.
    pub noise_floor: f32,
    /// Exclusive upper bound.
    pub ceiling: f32,
}

/// Borrowed ROI views of one frame.
pub struct RoiView<'a> {
    pub origin: (usize, usize),
    pub gray: ArrayView2<'a, u8>,
    pub depth: ArrayView2<'a, f32>,
    pub x: ArrayView2<'a, f32>,
    pub y: ArrayView2<'a, f32>,
    pub z: ArrayView2<'a, f32>,
}

impl<'a> RoiView<'a> {
    /// `rect` must lie inside the frame.
    pub fn new(frame: &'a Frame, rect: &Rect) -> Self {
        let (r0, c0) = (rect.y as usize, rect.x as usize);
        let (r1, c1) = (r0 + rect.height as usize, c0 + rect.width as usize);
        let window = s![r0..r1, c0..c1];
        Self {
            origin: (r0, c0),
            gray: frame.gray.slice(window),
            depth: frame.distance.slice(window),
            x: frame.x.slice(window),
            y: frame.y.slice(window),
            z: frame.z.slice(window),
        }
    }
}

/// Emits, per ROI column, the nearest pixel brighter than `threshold` whose
/// depth lies inside `window`. Columns without such a pixel emit nothing.
/// Ties keep the topmost row.
pub fn localize_roi(roi: &RoiView<'_>, threshold: u8, window: DepthWindow) -> Vec<SensorPoint> {
    let (rows, cols) = roi.gray.dim();
    let mut points = Vec::with_capacity(cols);

    for col in 0..cols {
        let mut nearest: Option<(usize, f32)> = None;
        let mut min_depth = window.ceiling;
        for row in 0..rows {
            let depth = roi.depth[[row, col]];
            if roi.gray[[row, col]] > threshold && depth < min_depth && depth > window.noise_floor {
                min_depth = depth;
                nearest = Some((row, depth));
            }
        }

        if let Some((row, depth)) = nearest {
            points.push(SensorPoint {
                row: roi.origin.0 + row,
                col: roi.origin.1 + col,
                x: roi.x[[row, col]],
                y: roi.y[[row, col]],
                z: roi.z[[row, col]],
                depth,
            });
        }
    }
    points
}
