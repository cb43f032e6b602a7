use image::{imageops::FilterType, RgbImage};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use tracing::{debug, info, instrument};

use super::Detector;
use crate::config::DetectionConfig;
use crate::error::{PerceptionError, Result};

/// SSD-style detector loaded from an ONNX file.
///
/// Input is NCHW `f32` with raw 0..255 pixel values; output 0 is the
/// flattened detection table.
pub struct OrtDetector {
    session: Session,
    input_width: u32,
    input_height: u32,
    output_stride: usize,
}

impl OrtDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        config.validate()?;
        info!("Loading detector model {}", config.model_path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&config.model_path)
            .map_err(|e| {
                PerceptionError::InferenceError(format!(
                    "Failed to load model {}: {}",
                    config.model_path.display(),
                    e
                ))
            })?;

        info!("Detector model loaded");
        Ok(Self {
            session,
            input_width: config.input_width,
            input_height: config.input_height,
            output_stride: config.output_stride,
        })
    }

    fn preprocess(&self, image: &RgbImage) -> Vec<f32> {
        let resized = image::imageops::resize(
            image,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let plane = (self.input_width * self.input_height) as usize;
        let mut tensor = vec![0.0f32; 3 * plane];
        for (idx, pixel) in resized.pixels().enumerate() {
            for channel in 0..3 {
                tensor[channel * plane + idx] = pixel.0[channel] as f32;
            }
        }
        tensor
    }
}

impl Detector for OrtDetector {
    #[instrument(skip(self, image), level = "debug")]
    fn infer(&mut self, image: &RgbImage) -> Result<Vec<f32>> {
        let shape = [
            1usize,
            3,
            self.input_height as usize,
            self.input_width as usize,
        ];
        let input = Tensor::from_array((shape, self.preprocess(image)))?;
        let outputs = self.session.run(ort::inputs![input])?;

        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        if data.len() % self.output_stride != 0 {
            return Err(PerceptionError::InferenceError(format!(
                "Output length {} is not a multiple of stride {}",
                data.len(),
                self.output_stride
            )));
        }
        debug!("Detector produced {} rows", data.len() / self.output_stride);
        Ok(data.to_vec())
    }
}
