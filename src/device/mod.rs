pub mod axis;
pub mod controller;
pub mod distance;
pub mod models;
pub mod stage;
pub mod status;

pub use axis::Axis;
pub use controller::Controller;
pub use distance::{Distance, Unit};
pub use models::*;
pub use stage::{Stage, StageKind};
pub use status::Status;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not connected")]
    NotConnected,

    #[error("No axes registered")]
    NoAxes,

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Model not found in the settings file")]
    ModelNotFound,

    #[error("Settings file not found: {}", .0.display())]
    SettingsNotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
