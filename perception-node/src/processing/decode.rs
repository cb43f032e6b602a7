use super::{Detection, Rect};

const CLASS_OFFSET: usize = 1;
const CONFIDENCE_OFFSET: usize = 2;
const BOX_OFFSET: usize = 3;

/// Decodes flattened detector rows into pixel-space detections.
///
/// Rows at or below `confidence_threshold` are skipped. Boxes are clamped
/// to the `width` x `height` image and dropped if nothing is left. Class
/// ids are shifted down by one since id 0 is the background class. A
/// trailing partial row is ignored.
pub fn decode_detections(
    raw: &[f32],
    stride: usize,
    confidence_threshold: f32,
    width: usize,
    height: usize,
) -> Vec<Detection> {
    if stride < BOX_OFFSET + 4 {
        return Vec::new();
    }

    let (w, h) = (width as f32, height as f32);
    let mut detections = Vec::new();
    for row in raw.chunks_exact(stride) {
        let confidence = row[CONFIDENCE_OFFSET];
        // Also rejects NaN.
        if !(confidence > confidence_threshold) {
            continue;
        }

        let x1 = ((row[BOX_OFFSET] * w).floor() as i32).max(0);
        let y1 = ((row[BOX_OFFSET + 1] * h).floor() as i32).max(0);
        let x2 = ((row[BOX_OFFSET + 2] * w).floor() as i32).min(width as i32 - 1);
        let y2 = ((row[BOX_OFFSET + 3] * h).floor() as i32).min(height as i32 - 1);

        if x2 < x1 || y2 < y1 {
            continue;
        }
        let rect = Rect::new(x1, y1, x2 - x1 + 1, y2 - y1 + 1);

        detections.push(Detection {
            class_id: (row[CLASS_OFFSET] as i32).saturating_sub(1),
            confidence,
            rect,
        });
    }
    detections
}
