use std::collections::VecDeque;

use image::RgbImage;

use crate::config::DetectionConfig;
use crate::error::{PerceptionError, Result};

#[cfg(feature = "onnx")]
pub mod ort_engine;

/// Object detector run on the false-colored depth image.
///
/// Returns the raw output rows flattened, `output_stride` values per
/// detection: `[image_id, class_id, confidence, x1, y1, x2, y2]` with box
/// corners normalized to 0..1. Resizing to the network input is the
/// detector's job.
pub trait Detector: Send {
    fn infer(&mut self, image: &RgbImage) -> Result<Vec<f32>>;
}

/// Detector that never finds anything.
#[derive(Debug, Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn infer(&mut self, _image: &RgbImage) -> Result<Vec<f32>> {
        Ok(Vec::new())
    }
}

/// Replays queued outputs in order, then returns the fallback for every later call.
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    queue: VecDeque<Result<Vec<f32>>>,
    fallback: Vec<f32>,
}

impl ScriptedDetector {
    pub fn new(fallback: Vec<f32>) -> Self {
        Self {
            queue: VecDeque::new(),
            fallback,
        }
    }

    pub fn push_output(&mut self, output: Vec<f32>) {
        self.queue.push_back(Ok(output));
    }

    pub fn push_error(&mut self, message: &str) {
        self.queue
            .push_back(Err(PerceptionError::InferenceError(message.to_string())));
    }
}

impl Detector for ScriptedDetector {
    fn infer(&mut self, _image: &RgbImage) -> Result<Vec<f32>> {
        self.queue
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Detector for the build: the ONNX model when compiled in, otherwise none.
pub fn create_detector(config: &DetectionConfig) -> Result<Box<dyn Detector>> {
    config.validate()?;

    #[cfg(feature = "onnx")]
    {
        let detector = ort_engine::OrtDetector::new(config)?;
        Ok(Box::new(detector))
    }

    #[cfg(not(feature = "onnx"))]
    {
        tracing::warn!(
            "Built without the onnx feature, model {} is not loaded and no objects will be detected",
            config.model_path.display()
        );
        Ok(Box::new(NullDetector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_detector_replays_then_falls_back() {
        let image = RgbImage::new(2, 2);
        let mut detector = ScriptedDetector::new(vec![9.0]);
        detector.push_output(vec![1.0, 2.0]);
        detector.push_error("boom");

        assert_eq!(detector.infer(&image).unwrap(), vec![1.0, 2.0]);
        assert!(detector.infer(&image).is_err());
        assert_eq!(detector.infer(&image).unwrap(), vec![9.0]);
        assert_eq!(detector.infer(&image).unwrap(), vec![9.0]);
    }

    #[test]
    fn test_null_detector_is_empty() {
        assert!(NullDetector.infer(&RgbImage::new(1, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_create_detector_rejects_zero_stride() {
        let config = DetectionConfig {
            output_stride: 0,
            ..Default::default()
        };
        assert!(matches!(
            create_detector(&config),
            Err(PerceptionError::ConfigError(_))
        ));
    }
}
