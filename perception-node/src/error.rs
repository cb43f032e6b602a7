use std::path::PathBuf;

use thiserror::Error;
use tof_common::ProtocolError;

#[derive(Error, Debug)]
pub enum PerceptionError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Sensor initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Use case unavailable: {0}")]
    UseCaseUnavailable(String),

    #[error("Processing parameters rejected: {0}")]
    ParameterRejected(String),

    #[error("Camera error: {0}")]
    CameraError(String),

    #[error("Exposure time not applied after {attempts} attempts: {reason}")]
    ExposureRetriesExhausted { attempts: u32, reason: String },

    #[error("Failed to load transform from {path}: {reason}")]
    TransformLoadError { path: PathBuf, reason: String },

    #[error("Another instance is already running (lock file {0})")]
    AlreadyRunning(PathBuf),

    #[error("Inference error: {0}")]
    InferenceError(String),

    #[error("Messaging error: {0}")]
    MessagingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Image error: {0}")]
    ImageError(String),
}

impl PerceptionError {
    /// Errors that keep the daemon from reaching its running state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PerceptionError::DeviceNotFound(_)
                | PerceptionError::InitializationFailed(_)
                | PerceptionError::UseCaseUnavailable(_)
                | PerceptionError::ParameterRejected(_)
                | PerceptionError::TransformLoadError { .. }
                | PerceptionError::AlreadyRunning(_)
                | PerceptionError::ConfigError(_)
        )
    }
}

impl From<zmq::Error> for PerceptionError {
    fn from(error: zmq::Error) -> Self {
        PerceptionError::MessagingError(error.to_string())
    }
}

impl From<config::ConfigError> for PerceptionError {
    fn from(error: config::ConfigError) -> Self {
        PerceptionError::ConfigError(error.to_string())
    }
}

impl From<image::ImageError> for PerceptionError {
    fn from(error: image::ImageError) -> Self {
        PerceptionError::ImageError(error.to_string())
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for PerceptionError {
    fn from(error: ort::Error) -> Self {
        PerceptionError::InferenceError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PerceptionError>;
