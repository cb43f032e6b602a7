//! Sensor boundary and everything that sits on the capture side of the
//! frame hand-off.
//!
//! The vendor driver is reached only through [`SensorDevice`]; frames come
//! back through a single callback that converts raw [`DepthData`] into a
//! [`Frame`] and pushes it into the [`FrameBuffer`].

pub mod frame;
pub mod frame_buffer;
pub mod lifecycle;
pub mod mock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SensorConfig;
use crate::error::{PerceptionError, Result};

pub use frame::{Frame, FrameConverter};
pub use frame_buffer::FrameBuffer;
pub use lifecycle::{CameraController, CameraState, ReconcileAction};
pub use mock::{MockSensorDevice, MockSensorFactory};

/// One measured point as delivered by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DepthPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub noise: f32,
    pub gray_value: u16,
}

/// Raw acquisition handed to the frame callback, row-major.
#[derive(Debug, Clone)]
pub struct DepthData {
    /// Sensor clock, microseconds.
    pub timestamp: u64,
    pub width: usize,
    pub height: usize,
    pub points: Vec<DepthPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingFlag {
    UseRemoveFlyingPixel,
    UseRemoveStrayLight,
    AdaptiveNoiseFilterType,
    NoiseThreshold,
    GlobalBinning,
    UseValidateImage,
    UseAdaptiveNoiseFilter,
    UseMpiFlagAverage,
    UseMpiFlagAmp,
    UseMpiFlagDist,
    UseFilter2Freq,
    UseSmoothingFilter,
    UseFlagSbi,
    UseHoleFilling,
    AutoExposureRefValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Bool(bool),
    Int(i32),
    Float(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureMode {
    Manual,
    Automatic,
}

/// Failure status reported by the driver for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    #[error("device is busy")]
    Busy,

    #[error("operation not supported")]
    NotSupported,

    #[error("{0}")]
    Other(String),
}

pub type DeviceResult<T> = std::result::Result<T, DeviceStatus>;

pub type FrameCallback = Box<dyn FnMut(&DepthData) + Send + 'static>;

/// Capability exposed by a ToF sensor driver.
///
/// The handle is owned by the processing thread; only the registered
/// callback runs on the driver's own thread.
pub trait SensorDevice: Send {
    fn initialize(&mut self) -> DeviceResult<()>;
    fn use_cases(&self) -> DeviceResult<Vec<String>>;
    fn set_use_case(&mut self, name: &str) -> DeviceResult<()>;
    fn set_exposure_mode(&mut self, mode: ExposureMode) -> DeviceResult<()>;
    /// Inclusive (min, max) exposure in microseconds for the active use case.
    fn exposure_limits(&self) -> DeviceResult<(u32, u32)>;
    fn set_exposure_time(&mut self, exposure_us: u32) -> DeviceResult<()>;
    fn processing_parameters(&self) -> DeviceResult<Vec<(ProcessingFlag, ParameterValue)>>;
    fn set_processing_parameters(
        &mut self,
        parameters: &[(ProcessingFlag, ParameterValue)],
    ) -> DeviceResult<()>;
    fn register_frame_callback(&mut self, callback: FrameCallback) -> DeviceResult<()>;
    fn start_capture(&mut self) -> DeviceResult<()>;
    fn stop_capture(&mut self) -> DeviceResult<()>;
    fn is_capturing(&self) -> DeviceResult<bool>;
    /// (width, height) in pixels.
    fn sensor_size(&self) -> DeviceResult<(usize, usize)>;
    fn frame_rate(&self) -> DeviceResult<u16>;
}

/// Opens the first available device, if any.
pub trait SensorFactory: Send {
    fn open(&mut self) -> Option<Box<dyn SensorDevice>>;
}

/// Factory for the driver named in the configuration.
pub fn create_factory(config: &SensorConfig) -> Result<Box<dyn SensorFactory>> {
    match config.driver.as_str() {
        "mock" => Ok(Box::new(MockSensorFactory::default())),
        other => Err(PerceptionError::ConfigError(format!(
            "Unknown sensor driver '{}'",
            other
        ))),
    }
}
