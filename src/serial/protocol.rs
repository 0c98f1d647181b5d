//! Line codec for the controller's `[L:]TAG=value` protocol.
//!
//! The same grammar serves three directions: commands we write, telemetry
//! the controller streams back, and the plain-text settings resource.
use once_cell::sync::Lazy;
use regex::Regex;

/// Telemetry tags are fixed width; anything else on the wire is ignored.
pub const TELEMETRY_TAG_LEN: usize = 4;

/// Partial-line buffer cap before the oldest bytes are discarded.
const MAX_PARTIAL_LEN: usize = 8192;
const TRIMMED_PARTIAL_LEN: usize = 4096;

static LINE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<letter>[A-Z]):)?(?P<tag>\w+)\s*=\s*(?P<value>[-+]?[0-9]*\.?[0-9]+)")
        .expect("line pattern is a valid regex")
});

/// One decoded `[L:]TAG=value` line with the value kept as written.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedLine {
    pub letter: Option<char>,
    pub tag: String,
    pub value: f64,
    raw_value: String,
}

impl TaggedLine {
    /// The value as an integer, if it was written as one.
    pub fn integer_value(&self) -> Option<i64> {
        self.raw_value.parse().ok()
    }
}

/// A telemetry sample routed to an axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub letter: Option<char>,
    pub tag: String,
    pub value: i64,
}

/// Match a line against the tag/value grammar.
pub fn parse_line(line: &str) -> Option<TaggedLine> {
    let caps = LINE_PATTERN.captures(line)?;
    let letter = caps
        .name("letter")
        .and_then(|m| m.as_str().chars().next());
    let tag = caps.name("tag")?.as_str().to_string();
    let raw_value = caps.name("value")?.as_str().to_string();
    let value = raw_value.parse::<f64>().ok()?;

    Some(TaggedLine {
        letter,
        tag,
        value,
        raw_value,
    })
}

/// Decode a telemetry line: 4-character tag and an integer value.
///
/// The controller reports 32-bit values; anything outside that range is
/// line noise and is dropped.
pub fn parse_telemetry(line: &str) -> Option<Telemetry> {
    let parsed = parse_line(line.trim())?;
    if parsed.tag.chars().count() != TELEMETRY_TAG_LEN {
        return None;
    }
    let value = parsed.raw_value.parse::<i32>().ok()?;
    Some(Telemetry {
        letter: parsed.letter,
        tag: parsed.tag,
        value: i64::from(value),
    })
}

/// Encode an outgoing command line.
///
/// Single-axis systems take the bare command; with more than one axis the
/// axis letter is prefixed.
pub fn encode_command(letter: Option<char>, single_axis: bool, command: &str) -> String {
    match letter {
        Some(letter) if !single_axis => format!("{}:{}\n", letter, command),
        _ => format!("{}\n", command),
    }
}

/// Reassembles lines from arbitrarily split read chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: String,
    trims: u64,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete, non-blank line it closed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find(['\n', '\r']) {
            let line = self.partial[..pos].trim().to_string();
            self.partial.drain(..=pos);
            if !line.is_empty() {
                lines.push(line);
            }
        }

        if self.partial.len() > MAX_PARTIAL_LEN {
            let mut cut = self.partial.len() - TRIMMED_PARTIAL_LEN;
            while !self.partial.is_char_boundary(cut) {
                cut += 1;
            }
            self.partial.drain(..cut);
            self.trims += 1;
            log::warn!("Telemetry line exceeded {} bytes, buffer trimmed", MAX_PARTIAL_LEN);
        }

        lines
    }

    pub fn pending(&self) -> &str {
        &self.partial
    }

    pub fn trims(&self) -> u64 {
        self.trims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_with_letter() {
        let line = parse_line("X:SSPD=10").unwrap();
        assert_eq!(line.letter, Some('X'));
        assert_eq!(line.tag, "SSPD");
        assert_eq!(line.value, 10.0);
    }

    #[test]
    fn test_parse_line_spaces_and_trailing_text() {
        let line = parse_line("LLIM = -5.5 % low limit").unwrap();
        assert_eq!(line.letter, None);
        assert_eq!(line.tag, "LLIM");
        assert_eq!(line.value, -5.5);
        assert_eq!(line.integer_value(), None);
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        assert!(parse_line("").is_none());
        assert!(parse_line("hello world").is_none());
        assert!(parse_line("x:EPOS=1").is_none());
        assert!(parse_line("EPOS=").is_none());
    }

    #[test]
    fn test_parse_telemetry_requires_four_char_tag() {
        let t = parse_telemetry("Y:EPOS=-500").unwrap();
        assert_eq!(t.letter, Some('Y'));
        assert_eq!(t.tag, "EPOS");
        assert_eq!(t.value, -500);

        assert!(parse_telemetry("PCTIME=12").is_none());
        assert!(parse_telemetry("POS=12").is_none());
        assert!(parse_telemetry("EPOS=1.5").is_none());
    }

    #[test]
    fn test_parse_telemetry_drops_out_of_range_values() {
        assert_eq!(parse_telemetry("EPOS=2147483647").unwrap().value, i64::from(i32::MAX));
        assert_eq!(parse_telemetry("EPOS=-2147483648").unwrap().value, i64::from(i32::MIN));
        assert!(parse_telemetry("EPOS=2147483648").is_none());
        assert!(parse_telemetry("EPOS=-9223372036854775808").is_none());
        assert!(parse_telemetry("STAT=99999999999999999999999").is_none());
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(encode_command(Some('X'), true, "DPOS=100"), "DPOS=100\n");
        assert_eq!(encode_command(Some('Y'), false, "DPOS=100"), "Y:DPOS=100\n");
        assert_eq!(encode_command(None, false, "RSET"), "RSET\n");
    }

    #[test]
    fn test_line_buffer_reassembles_split_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push("EPO").is_empty());
        let lines = buffer.push("S=5\r\nSTAT=1024\n\nDP");
        assert_eq!(lines, vec!["EPOS=5".to_string(), "STAT=1024".to_string()]);
        assert_eq!(buffer.pending(), "DP");
    }

    #[test]
    fn test_line_buffer_trims_runaway_partial() {
        let mut buffer = LineBuffer::new();
        buffer.push(&"A".repeat(MAX_PARTIAL_LEN + 10));
        assert_eq!(buffer.pending().len(), TRIMMED_PARTIAL_LEN);
        assert_eq!(buffer.trims(), 1);
    }
}
