use super::Detection;

/// Greedy non-maximum suppression.
///
/// Candidates above `score_threshold` are visited by descending confidence
/// (ties keep input order); a candidate is kept unless its IoU with an
/// already kept box exceeds `nms_threshold`. Returns indices into
/// `detections` in visit order.
pub fn non_max_suppression(
    detections: &[Detection],
    score_threshold: f32,
    nms_threshold: f32,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..detections.len())
        .filter(|&i| detections[i].confidence > score_threshold)
        .collect();
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .total_cmp(&detections[a].confidence)
    });

    let mut kept: Vec<usize> = Vec::with_capacity(order.len());
    for idx in order {
        let rect = &detections[idx].rect;
        if kept
            .iter()
            .all(|&k| detections[k].rect.iou(rect) <= nms_threshold)
        {
            kept.push(idx);
        }
    }
    kept
}
