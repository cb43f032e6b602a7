//! ToF perception daemon: sensor lifecycle, obstacle detection and
//! localization, and the local IPC link to the robot process.

pub mod camera;
pub mod config;
pub mod daemon;
pub mod error;
pub mod inference;
pub mod messaging;
pub mod processing;
pub mod transform;

pub use config::PerceptionConfig;
pub use error::{PerceptionError, Result};
