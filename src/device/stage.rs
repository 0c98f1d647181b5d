//! Catalog of supported stage models.
use std::f64::consts::PI;

use super::{DeviceError, Result};

/// Volts in the settings file to the device's amplitude unit.
pub const AMPLITUDE_MULTIPLIER: f64 = 1456.0;
/// Degrees in the settings file to the device's phase unit.
pub const PHASE_MULTIPLIER: f64 = 182.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageKind {
    Linear,
    Rotational { counts_per_revolution: f64 },
}

/// Fixed parameters of one stage model.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Identification line as it appears in a settings file, e.g. `XLA1=312`.
    pub command: &'static str,
    /// Nanometers (or micro-radians for rotational stages) per encoder count.
    pub encoder_resolution: f64,
    /// Settings-file speed unit to device speed unit.
    pub speed_multiplier: f64,
    pub kind: StageKind,
}

const fn linear(command: &'static str, encoder_resolution: f64) -> Stage {
    Stage {
        command,
        encoder_resolution,
        speed_multiplier: 1000.0,
        kind: StageKind::Linear,
    }
}

const fn rotational(
    command: &'static str,
    encoder_resolution: f64,
    counts_per_revolution: f64,
) -> Stage {
    Stage {
        command,
        encoder_resolution,
        speed_multiplier: 100.0,
        kind: StageKind::Rotational {
            counts_per_revolution,
        },
    }
}

const MICRORAD_PER_REV: f64 = 2.0 * PI * 1_000_000.0;

static CATALOG: [Stage; 22] = [
    linear("XLS1=312", 312.5),
    linear("XLS1=1250", 1250.0),
    linear("XLS1=78", 78.125),
    linear("XLS1=5", 5.0),
    linear("XLS1=1", 1.0),
    linear("XLS3=312", 312.5),
    linear("XLS3=1250", 1250.0),
    linear("XLS3=78", 78.125),
    linear("XLS3=5", 5.0),
    linear("XLS3=1", 1.0),
    linear("XLA1=312", 312.5),
    linear("XLA1=1250", 1250.0),
    linear("XLA1=78", 78.125),
    rotational("XRTA=109", MICRORAD_PER_REV / 57600.0, 57600.0),
    rotational("XRT1=2", MICRORAD_PER_REV / 86400.0, 86400.0),
    rotational("XRT1=18", MICRORAD_PER_REV / 86400.0, 86400.0),
    rotational("XRT1=47", MICRORAD_PER_REV / 86400.0, 86400.0),
    rotational("XRT1=73", MICRORAD_PER_REV / 86400.0, 86400.0),
    rotational("XRT1=3", MICRORAD_PER_REV / 1843200.0, 1843200.0),
    rotational("XRT1=19", MICRORAD_PER_REV / 360000.0, 360000.0),
    rotational("XRT1=49", MICRORAD_PER_REV / 144000.0, 144000.0),
    rotational("XRT1=109", MICRORAD_PER_REV / 57600.0, 57600.0),
];

impl Stage {
    /// Look a model up by its exact identification line.
    pub fn lookup(command: &str) -> Result<&'static Stage> {
        CATALOG
            .iter()
            .find(|stage| stage.command == command)
            .ok_or_else(|| DeviceError::UnknownStage(command.to_string()))
    }

    pub fn catalog() -> &'static [Stage] {
        &CATALOG
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.kind, StageKind::Linear)
    }

    pub fn counts_per_revolution(&self) -> Option<f64> {
        match self.kind {
            StageKind::Linear => None,
            StageKind::Rotational {
                counts_per_revolution,
            } => Some(counts_per_revolution),
        }
    }
}
