pub mod settings;

pub use settings::{file_value, Settings, SettingsEntry};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, Result};
use crate::serial::interface::DEFAULT_BAUD_RATE;

/// Controller options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerOptions {
    /// Serial port path, e.g. `/dev/ttyACM0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    pub settings_file: PathBuf,
    /// Read/write timeout of the serial handle.
    pub timeout_ms: u64,
    /// How long a single reader-loop read waits for bytes.
    pub reader_poll_ms: u64,
    /// Pause between resetting the axes and replaying settings.
    pub reset_settle_ms: u64,
    /// Upper bound on any wait for fresh telemetry.
    pub update_timeout_ms: u64,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            settings_file: PathBuf::from("settings_default.txt"),
            timeout_ms: 1000,
            reader_poll_ms: 25,
            reset_settle_ms: 200,
            update_timeout_ms: 5000,
        }
    }
}

impl ControllerOptions {
    pub fn new(port: impl Into<String>, settings_file: impl Into<PathBuf>) -> Self {
        Self {
            port: port.into(),
            settings_file: settings_file.into(),
            ..Self::default()
        }
    }

    /// Read options from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            DeviceError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })
    }
}
