use std::fmt;
use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

const NM_PER_MM: f64 = 1_000_000.0;
const NM_PER_UM: f64 = 1_000.0;
const NM_PER_INCH: f64 = 25.4 * NM_PER_MM;
const NM_PER_MILLI_INCH: f64 = 25.4 * NM_PER_UM;

/// Length units accepted by [`Distance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Millimeter,
    Micrometer,
    Nanometer,
    Inch,
    MilliInch,
}

impl Unit {
    fn nanometers_per_unit(self) -> f64 {
        match self {
            Unit::Millimeter => NM_PER_MM,
            Unit::Micrometer => NM_PER_UM,
            Unit::Nanometer => 1.0,
            Unit::Inch => NM_PER_INCH,
            Unit::MilliInch => NM_PER_MILLI_INCH,
        }
    }
}

/// An immutable length, stored in nanometers.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Distance {
    nm: f64,
}

impl Distance {
    pub const ZERO: Distance = Distance { nm: 0.0 };

    pub fn new(value: f64, unit: Unit) -> Self {
        Self {
            nm: value * unit.nanometers_per_unit(),
        }
    }

    pub fn from_nanometers(nm: f64) -> Self {
        Self { nm }
    }

    /// Read the value in `unit`.
    pub fn get(&self, unit: Unit) -> f64 {
        self.nm / unit.nanometers_per_unit()
    }

    /// The canonical value used for command payloads.
    pub fn as_nanometers(&self) -> f64 {
        self.nm
    }

    /// Encoder counts for a stage of the given resolution (nm per count),
    /// truncated toward zero.
    pub fn to_encoder_counts(&self, encoder_resolution: f64) -> i64 {
        (self.nm / encoder_resolution).trunc() as i64
    }

    pub fn from_encoder_counts(counts: i64, encoder_resolution: f64) -> Self {
        Self::from_nanometers(counts as f64 * encoder_resolution)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} um", self.get(Unit::Micrometer))
    }
}

impl Add for Distance {
    type Output = Distance;

    fn add(self, rhs: Distance) -> Distance {
        Distance::from_nanometers(self.nm + rhs.nm)
    }
}

impl Sub for Distance {
    type Output = Distance;

    fn sub(self, rhs: Distance) -> Distance {
        Distance::from_nanometers(self.nm - rhs.nm)
    }
}

impl Neg for Distance {
    type Output = Distance;

    fn neg(self) -> Distance {
        Distance::from_nanometers(-self.nm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_UNITS: [Unit; 5] = [
        Unit::Millimeter,
        Unit::Micrometer,
        Unit::Nanometer,
        Unit::Inch,
        Unit::MilliInch,
    ];

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn test_known_conversions() {
        let one_mm = Distance::new(1.0, Unit::Millimeter);
        assert_eq!(one_mm.get(Unit::Micrometer), 1000.0);
        assert_eq!(one_mm.get(Unit::Nanometer), 1_000_000.0);
        assert!(close(Distance::new(1.0, Unit::Inch).get(Unit::Millimeter), 25.4));
        assert!(close(Distance::new(1.0, Unit::MilliInch).get(Unit::Micrometer), 25.4));
    }

    #[test]
    fn test_round_trip_through_every_unit() {
        for original in ALL_UNITS {
            let d = Distance::new(-12.345, original);
            for via in ALL_UNITS {
                let back = Distance::new(d.get(via), via).get(original);
                assert!(close(back, -12.345), "{:?} via {:?} gave {}", original, via, back);
            }
        }
    }

    #[test]
    fn test_arithmetic_returns_new_values() {
        let a = Distance::new(2.0, Unit::Millimeter);
        let b = Distance::new(500.0, Unit::Micrometer);
        assert_eq!((a + b).get(Unit::Micrometer), 2500.0);
        assert_eq!((a - b).get(Unit::Micrometer), 1500.0);
        assert_eq!((-a).get(Unit::Millimeter), -2.0);
        assert_eq!(a.get(Unit::Millimeter), 2.0);
    }

    #[test]
    fn test_encoder_counts_truncate_toward_zero() {
        let resolution = 312.5;
        assert_eq!(Distance::new(1000.0, Unit::Nanometer).to_encoder_counts(resolution), 3);
        assert_eq!(Distance::new(-1000.0, Unit::Nanometer).to_encoder_counts(resolution), -3);
        assert_eq!(Distance::new(5.0, Unit::Millimeter).to_encoder_counts(resolution), 16000);
        assert_eq!(Distance::from_encoder_counts(16000, resolution).get(Unit::Millimeter), 5.0);
    }

    #[test]
    fn test_display_in_micrometers() {
        assert_eq!(Distance::new(1.5, Unit::Millimeter).to_string(), "1500 um");
    }
}
