use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::camera::{ParameterValue, ProcessingFlag};
use crate::error::{PerceptionError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PerceptionConfig {
    pub node_id: String,
    pub sensor: SensorConfig,
    pub detection: DetectionConfig,
    pub transform: TransformConfig,
    pub messaging: MessagingConfig,
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SensorConfig {
    /// Name of the sensor driver; `mock` is the only in-tree driver.
    pub driver: String,
    pub use_case: String,
    /// 0 selects automatic exposure.
    pub exposure_time_us: u32,
    pub exposure_retry_count: u32,
    /// Backoff per retry, divided by the use-case frame rate.
    pub exposure_retry_backoff_ms: u64,
    pub processing: ProcessingSettings,
    pub conversion: ConversionConfig,
}

/// Processing flags written to the sensor at initialization.
///
/// `None` leaves the device's own value untouched.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProcessingSettings {
    pub use_remove_flying_pixel: Option<bool>,
    pub use_remove_stray_light: Option<bool>,
    pub adaptive_noise_filter_type: Option<i32>,
    pub noise_threshold: Option<f32>,
    pub global_binning: Option<i32>,
    pub use_validate_image: Option<bool>,
    pub use_adaptive_noise_filter: Option<bool>,
    pub use_mpi_flag_average: Option<bool>,
    pub use_mpi_flag_amp: Option<bool>,
    pub use_mpi_flag_dist: Option<bool>,
    pub use_filter_2_freq: Option<bool>,
    pub use_smoothing_filter: Option<bool>,
    pub use_flag_sbi: Option<bool>,
    pub use_hole_filling: Option<bool>,
    pub auto_exposure_ref_value: Option<f32>,
}

impl ProcessingSettings {
    pub fn production() -> Self {
        Self {
            use_remove_flying_pixel: Some(false),
            use_remove_stray_light: Some(true),
            adaptive_noise_filter_type: Some(2),
            noise_threshold: Some(0.14),
            global_binning: Some(2),
            ..Default::default()
        }
    }

    /// Configured overrides as (flag, value) pairs.
    pub fn overrides(&self) -> Vec<(ProcessingFlag, ParameterValue)> {
        use ProcessingFlag::*;

        let bools = [
            (UseRemoveFlyingPixel, self.use_remove_flying_pixel),
            (UseRemoveStrayLight, self.use_remove_stray_light),
            (UseValidateImage, self.use_validate_image),
            (UseAdaptiveNoiseFilter, self.use_adaptive_noise_filter),
            (UseMpiFlagAverage, self.use_mpi_flag_average),
            (UseMpiFlagAmp, self.use_mpi_flag_amp),
            (UseMpiFlagDist, self.use_mpi_flag_dist),
            (UseFilter2Freq, self.use_filter_2_freq),
            (UseSmoothingFilter, self.use_smoothing_filter),
            (UseFlagSbi, self.use_flag_sbi),
            (UseHoleFilling, self.use_hole_filling),
        ];
        let ints = [
            (AdaptiveNoiseFilterType, self.adaptive_noise_filter_type),
            (GlobalBinning, self.global_binning),
        ];
        let floats = [
            (NoiseThreshold, self.noise_threshold),
            (AutoExposureRefValue, self.auto_exposure_ref_value),
        ];

        let mut overrides = Vec::new();
        for (flag, value) in bools {
            if let Some(v) = value {
                overrides.push((flag, ParameterValue::Bool(v)));
            }
        }
        for (flag, value) in ints {
            if let Some(v) = value {
                overrides.push((flag, ParameterValue::Int(v)));
            }
        }
        for (flag, value) in floats {
            if let Some(v) = value {
                overrides.push((flag, ParameterValue::Float(v)));
            }
        }
        overrides
    }
}

/// Constants used to turn raw sensor points into detector and localization images.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConversionConfig {
    pub clip_distance_max: f32,
    pub depth_normal: f32,
    pub gray_normal: f32,
    pub noise_scale: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub output_stride: usize,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub class_names: Vec<String>,
    /// ROIs with this many points or fewer are dropped.
    pub min_valid_object_points: usize,
    pub depth_noise_floor: f32,
    pub depth_ceiling: f32,
}

impl DetectionConfig {
    /// Image id, class, confidence and four box corners.
    pub const MIN_OUTPUT_STRIDE: usize = 7;

    pub fn validate(&self) -> Result<()> {
        if self.output_stride < Self::MIN_OUTPUT_STRIDE {
            return Err(PerceptionError::ConfigError(format!(
                "detection.output_stride must be at least {}, got {}",
                Self::MIN_OUTPUT_STRIDE,
                self.output_stride
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransformConfig {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MessagingConfig {
    pub publish_endpoint: String,
    pub command_endpoint: String,
    pub send_high_water_mark: i32,
    pub command_poll_ms: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DaemonConfig {
    pub lock_file: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub working_dir: PathBuf,
    pub detach: bool,
    pub frame_wait_ms: u64,
    pub idle_sleep_ms: u64,
    pub save_data: bool,
    pub data_root: PathBuf,
}

impl DaemonConfig {
    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            node_id: "tof-daemon".to_string(),
            sensor: SensorConfig::default(),
            detection: DetectionConfig::default(),
            transform: TransformConfig::default(),
            messaging: MessagingConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            driver: "mock".to_string(),
            use_case: "MODE_9_5FPS".to_string(),
            exposure_time_us: 0,
            exposure_retry_count: 5,
            exposure_retry_backoff_ms: 500,
            processing: ProcessingSettings::production(),
            conversion: ConversionConfig::default(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            clip_distance_max: 4.0,
            depth_normal: 1.0,
            gray_normal: 255.0,
            noise_scale: 1300.0,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("/user/models/tof_detector.onnx"),
            input_width: 300,
            input_height: 300,
            output_stride: 7,
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            class_names: vec!["Fabric".to_string(), "Cord".to_string()],
            min_valid_object_points: 0,
            depth_noise_floor: 0.1,
            depth_ceiling: 100.0,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/user/transformation_matrix_tof_into_lds.conf"),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            publish_endpoint: "ipc:///tmp/tof_stream_data".to_string(),
            command_endpoint: "ipc:///tmp/tof_command".to_string(),
            send_high_water_mark: 10,
            command_poll_ms: 500,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from("/tmp/tofdaemon.lock"),
            pid_file: None,
            working_dir: PathBuf::from("/tmp"),
            detach: false,
            frame_wait_ms: 1000,
            idle_sleep_ms: 100,
            save_data: false,
            data_root: PathBuf::from("/home/root/tof-data-repo"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
