use tof_common::{ObjectId, Point2D};
use tracing::{debug, info, instrument};

use super::decode::decode_detections;
use super::localize::{localize_roi, DepthWindow, RoiView};
use super::nms::non_max_suppression;
use super::otsu::otsu_threshold;
use super::DetectedObject;
use crate::camera::Frame;
use crate::config::DetectionConfig;
use crate::error::Result;
use crate::inference::Detector;
use crate::transform::CoordinateTransformer;

/// Detector, NMS, per-ROI localization and transform for one frame at a time.
pub struct DetectionPipeline {
    config: DetectionConfig,
    detector: Box<dyn Detector>,
    transformer: CoordinateTransformer,
    frames_processed: u64,
}

impl DetectionPipeline {
    pub fn new(
        config: DetectionConfig,
        detector: Box<dyn Detector>,
        transformer: CoordinateTransformer,
    ) -> Self {
        Self {
            config,
            detector,
            transformer,
            frames_processed: 0,
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Runs the detector on `frame` and localizes every surviving box.
    ///
    /// Only a detector failure is an error; malformed rows and degenerate
    /// boxes are dropped silently.
    #[instrument(skip(self, frame), level = "debug", fields(frame = self.frames_processed + 1))]
    pub fn process(&mut self, frame: &Frame) -> Result<Vec<DetectedObject>> {
        self.frames_processed += 1;
        let raw = self.detector.infer(&frame.color)?;

        let detections = decode_detections(
            &raw,
            self.config.output_stride,
            self.config.confidence_threshold,
            frame.width(),
            frame.height(),
        );
        let keep = non_max_suppression(
            &detections,
            self.config.confidence_threshold,
            self.config.nms_threshold,
        );
        debug!("{} detections, {} after NMS", detections.len(), keep.len());

        let window = DepthWindow {
            noise_floor: self.config.depth_noise_floor,
            ceiling: self.config.depth_ceiling,
        };

        let mut objects = Vec::with_capacity(keep.len());
        for idx in keep {
            let detection = detections[idx];
            info!(
                "Frame: {}, Object: {}, class: {} ({}), confidence: {:.2}, rect: ({},{},{},{})",
                self.frames_processed,
                idx,
                detection.class_id,
                self.class_name(detection.class_id),
                detection.confidence,
                detection.rect.x,
                detection.rect.y,
                detection.rect.width,
                detection.rect.height
            );

            let roi = RoiView::new(frame, &detection.rect);
            let threshold = otsu_threshold(roi.gray);
            let points = localize_roi(&roi, threshold, window);
            if points.len() <= self.config.min_valid_object_points {
                debug!("Object {} yields {} points, skipped", idx, points.len());
                continue;
            }

            let robot_points = points
                .iter()
                .map(|p| self.transformer.transform(p.x, p.y, p.z))
                .collect();
            objects.push(DetectedObject {
                class_id: detection.class_id,
                confidence: detection.confidence,
                rect: detection.rect,
                threshold,
                points,
                robot_points,
            });
        }
        Ok(objects)
    }

    fn class_name(&self, class_id: i32) -> &str {
        usize::try_from(class_id)
            .ok()
            .and_then(|i| self.config.class_names.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Flattens objects into the publish layout: all robot-frame points in
/// object order, plus the index of each object's last point.
pub fn collect_points(objects: &[DetectedObject]) -> (Vec<Point2D>, Vec<ObjectId>) {
    let mut points = Vec::new();
    let mut ids = Vec::with_capacity(objects.len());
    for object in objects {
        if object.robot_points.is_empty() {
            continue;
        }
        points.extend_from_slice(&object.robot_points);
        let class_id = u8::try_from(object.class_id).unwrap_or(u8::MAX);
        ids.push(ObjectId::new(class_id, (points.len() - 1) as u32));
    }
    (points, ids)
}
