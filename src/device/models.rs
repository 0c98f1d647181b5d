use serde::{Deserialize, Serialize};

/// Controller connection state, published on a watch channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// The link dropped or could not be opened.
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// One telemetry sample as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub axis: char,
    pub tag: String,
    pub value: i64,
}

/// Result of issuing a target position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOutcome {
    /// Sent without waiting (force-waiting off).
    Sent,
    Reached,
    TimedOut,
}

/// Result of an index search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Found,
    /// The controller stopped searching without a valid encoder.
    NotFound,
    /// Telemetry stopped arriving before the search resolved.
    TimedOut,
}

/// Result of a frequency calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    Finished,
    TimedOut,
}
