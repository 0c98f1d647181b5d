//! Plain-text settings resource: `[L:]TAG=value` lines.
//!
//! Values are stored as written. Unit corrections depend on the stage and are
//! applied per axis by [`file_value`] when the entries are replayed.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::device::stage::{Stage, AMPLITUDE_MULTIPLIER, PHASE_MULTIPLIER};
use crate::device::{DeviceError, Result};
use crate::serial::protocol::parse_line;

const COMMENT_MARKERS: [char; 2] = ['%', '#'];

/// Tag prefix identifying the stage model line.
pub const MODEL_TAG_PREFIX: &str = "XLA";

/// Polling-interval tag; its file value is remembered per axis.
pub const POLLING_INTERVAL_TAG: &str = "POLI";

/// One settings line.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsEntry {
    /// `None` addresses the first axis.
    pub axis: Option<char>,
    pub tag: String,
    pub value: f64,
}

/// Entries in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    entries: Vec<SettingsEntry>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DeviceError::SettingsNotFound(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let settings = Self::parse(BufReader::new(file))?;
        log::info!(
            "Loaded {} settings from {}",
            settings.entries.len(),
            path.display()
        );
        Ok(settings)
    }

    /// Parse a settings resource; non-matching lines are skipped.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let content = strip_comment(&line).trim();
            if content.is_empty() {
                continue;
            }
            match parse_line(content) {
                Some(parsed) => entries.push(SettingsEntry {
                    axis: parsed.letter,
                    tag: parsed.tag,
                    value: parsed.value,
                }),
                None => log::debug!("Invalid settings line: {:?}", line),
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[SettingsEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value recorded for `tag`, regardless of axis.
    pub fn get(&self, tag: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|entry| entry.tag == tag)
            .map(|entry| entry.value)
    }

    /// The catalog key built from the first model line, e.g. `XLA1=312`.
    pub fn model_key(&self) -> Option<String> {
        self.entries
            .iter()
            .find(|entry| entry.tag.starts_with(MODEL_TAG_PREFIX))
            .map(|entry| format!("{}={}", entry.tag, entry.value))
    }

    /// Resolve the stage named by the model line.
    pub fn model(&self) -> Result<&'static Stage> {
        let key = self.model_key().ok_or(DeviceError::ModelNotFound)?;
        Stage::lookup(&key)
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(COMMENT_MARKERS) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Convert a settings-file value to its device value, possibly renaming the tag.
///
/// Amplitudes are given in volts, phases in degrees, speeds in mm/s (deg/s)
/// and limits/zones in mm. `MASS` becomes a `CFRQ` frequency bucket.
pub fn file_value<'a>(tag: &'a str, value: f64, stage: &Stage) -> (&'a str, f64) {
    match tag {
        "MAMP" | "MIMP" | "OFSA" | "OFSB" | "AMPL" | "MAM2" => (tag, value * AMPLITUDE_MULTIPLIER),
        "PHAC" | "PHAS" => (tag, value * PHASE_MULTIPLIER),
        "SSPD" | "MSPD" | "ISPD" => (tag, value * stage.speed_multiplier),
        "ENCO" | "LLIM" | "RLIM" | "HLIM" | "ZON1" | "ZON2" => {
            (tag, value * 1e6 / stage.encoder_resolution)
        }
        "MASS" => ("CFRQ", mass_to_frequency(value)),
        _ => (tag, value),
    }
}

fn mass_to_frequency(mass: f64) -> f64 {
    if mass <= 50.0 {
        100_000.0
    } else if mass <= 100.0 {
        60_000.0
    } else if mass <= 250.0 {
        30_000.0
    } else if mass <= 500.0 {
        10_000.0
    } else if mass <= 1000.0 {
        5_000.0
    } else {
        3_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(text: &str) -> Settings {
        Settings::parse(Cursor::new(text)).unwrap()
    }

    #[test]
    fn test_parse_keeps_file_order_and_skips_noise() {
        let settings = parse(
            "% header comment\n\
             XLA1=312\n\
             \n\
             X:SSPD=10   % mm/s\n\
             not a setting\n\
             \tLLIM = -5\n\
             # disabled: HLIM=3\n\
             HLIM=5\n",
        );
        let tags: Vec<&str> = settings.entries().iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["XLA1", "SSPD", "LLIM", "HLIM"]);
        assert_eq!(settings.entries()[1].axis, Some('X'));
        assert_eq!(settings.get("LLIM"), Some(-5.0));
        assert_eq!(settings.get("HLIM"), Some(5.0));
        assert_eq!(settings.get("MASS"), None);
    }

    #[test]
    fn test_model_lookup() {
        let settings = parse("SSPD=10\nXLA1=1250\nXLA1=312\n");
        assert_eq!(settings.model_key().as_deref(), Some("XLA1=1250"));
        assert_eq!(settings.model().unwrap().encoder_resolution, 1250.0);
    }

    #[test]
    fn test_model_missing_or_unknown() {
        assert!(matches!(parse("SSPD=10\n").model(), Err(DeviceError::ModelNotFound)));
        assert!(matches!(parse("XLA1=7\n").model(), Err(DeviceError::UnknownStage(_))));
    }

    #[test]
    fn test_file_values() {
        let stage = Stage::lookup("XLA1=312").unwrap();
        assert_eq!(file_value("SSPD", 10.0, stage), ("SSPD", 10_000.0));
        assert_eq!(file_value("MAMP", 2.0, stage), ("MAMP", 2912.0));
        assert_eq!(file_value("PHAS", 1.0, stage), ("PHAS", 182.0));
        assert_eq!(file_value("LLIM", -5.0, stage), ("LLIM", -16_000.0));
        assert_eq!(file_value("PTO2", 7.0, stage), ("PTO2", 7.0));
    }

    #[test]
    fn test_mass_buckets() {
        let stage = Stage::lookup("XLA1=312").unwrap();
        let cases = [
            (10.0, 100_000.0),
            (50.0, 100_000.0),
            (75.0, 60_000.0),
            (250.0, 30_000.0),
            (400.0, 10_000.0),
            (1000.0, 5_000.0),
            (1001.0, 3_000.0),
        ];
        for (mass, frequency) in cases {
            assert_eq!(file_value("MASS", mass, stage), ("CFRQ", frequency), "mass {}", mass);
        }
    }
}
