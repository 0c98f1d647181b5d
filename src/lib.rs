//! Control core for Xeryon piezo positioning stages on a serial line.
//!
//! A [`Controller`] owns the serial connection and a background reader that
//! routes `[L:]TAG=value` telemetry to its [`Axis`] instances. Axis
//! operations are async and poll that telemetry for completion.
//!
//! ```no_run
//! use xeryon_core::{ControllerOptions, Controller, Distance, Unit};
//!
//! # async fn demo() -> xeryon_core::device::Result<()> {
//! let controller = Controller::new(ControllerOptions::new("/dev/ttyACM0", "settings_default.txt"))?;
//! let axis = controller.add_axis('X')?;
//! controller.start().await?;
//! axis.find_index(0).await?;
//! axis.set_force_waiting(true);
//! axis.set_target_position(Distance::new(1.5, Unit::Millimeter)).await?;
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```
pub mod config;
pub mod device;
pub mod serial;

pub use config::{ControllerOptions, Settings, SettingsEntry};
pub use device::{
    Axis, CalibrationOutcome, ConnectionState, Controller, DeviceError, Distance, IndexOutcome,
    MotionOutcome, Stage, StageKind, Status, TelemetryEvent, Unit,
};
pub use serial::{SerialError, SerialInterface, SerialPortIO};
