//! Per-axis state machine.
//!
//! Telemetry is written by the reader task through [`Axis::receive_data`];
//! every other method runs on the caller's task. The waiting operations poll
//! the telemetry maps on a coarse sleep cadence and never hold the state lock
//! across an await.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use super::models::{CalibrationOutcome, IndexOutcome, MotionOutcome, TelemetryEvent};
use super::{DeviceError, Distance, Result, Stage, Status, Unit};
use crate::config::settings::{file_value, POLLING_INTERVAL_TAG};
use crate::serial::{SerialError, SerialLink};

pub const TAG_MEASURED_POSITION: &str = "EPOS";
pub const TAG_DESIRED_POSITION: &str = "DPOS";
pub const TAG_STATUS: &str = "STAT";
pub const TAG_FREQUENCY: &str = "FREQ";
pub const TAG_DEVICE_TIME: &str = "TIME";
/// Host clock in milliseconds, synthesized whenever `TIME` arrives.
pub const TAG_HOST_TIME: &str = "PCTIME";

/// Telemetry updates a step waits for before returning. A heuristic, not a
/// tolerance check.
pub const STEP_SETTLE_UPDATES: u64 = 3;

const DEFAULT_POLLING_INTERVAL: i64 = 200;
const DEFAULT_MOTION_TIMEOUT_MS: i64 = 1000;
const DEFAULT_POSITION_TOLERANCE: i64 = 10;

const TARGET_POLL: Duration = Duration::from_millis(100);
const UPDATE_POLL: Duration = Duration::from_millis(10);
const INDEX_POLL: Duration = Duration::from_millis(200);
const CALIBRATION_POLL: Duration = Duration::from_millis(200);

/// Commands that start motion; they are cached but never replayed.
const MOTION_TAGS: [&str; 5] = ["DPOS", "SCAN", "INDX", "STEP", "FFRQ"];

const EVENT_CAPACITY: usize = 256;

struct AxisState {
    data: HashMap<String, i64>,
    /// Last value sent per tag, in first-sent order.
    settings: Vec<(String, i64)>,
    update_count: u64,
    was_valid_target: bool,
    polling_interval: i64,
}

impl AxisState {
    fn new() -> Self {
        let mut data = HashMap::new();
        data.insert(TAG_DESIRED_POSITION.to_string(), 0);
        data.insert(TAG_MEASURED_POSITION.to_string(), 0);
        data.insert(TAG_STATUS.to_string(), 0);
        Self {
            data,
            settings: Vec::new(),
            update_count: 0,
            was_valid_target: false,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }

    fn setting(&self, tag: &str) -> Option<i64> {
        self.settings
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, v)| *v)
    }

    fn store_setting(&mut self, tag: &str, value: i64) {
        match self.settings.iter_mut().find(|(t, _)| t == tag) {
            Some(entry) => entry.1 = value,
            None => self.settings.push((tag.to_string(), value)),
        }
    }

    fn datum(&self, tag: &str) -> i64 {
        self.data.get(tag).copied().unwrap_or(0)
    }
}

/// One controllable degree of freedom on the stage.
pub struct Axis {
    letter: char,
    stage: Stage,
    link: Arc<SerialLink>,
    state: Mutex<AxisState>,
    events: broadcast::Sender<TelemetryEvent>,
    force_waiting: AtomicBool,
    update_timeout: Duration,
}

impl Axis {
    pub(crate) fn new(
        letter: char,
        stage: Stage,
        link: Arc<SerialLink>,
        update_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            letter,
            stage,
            link,
            state: Mutex::new(AxisState::new()),
            events,
            force_waiting: AtomicBool::new(false),
            update_timeout,
        }
    }

    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Subscribe to every telemetry sample this axis receives.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }

    /// When enabled, [`set_target_position`](Self::set_target_position)
    /// waits for the move to finish.
    pub fn set_force_waiting(&self, enabled: bool) {
        self.force_waiting.store(enabled, Ordering::SeqCst);
    }

    pub fn force_waiting(&self) -> bool {
        self.force_waiting.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, AxisState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn send_raw(&self, command: &str) -> Result<()> {
        self.link
            .send_command(Some(self.letter), command)
            .await
            .map_err(|e| match e {
                SerialError::NotConnected => DeviceError::NotConnected,
                other => DeviceError::SerialError(other),
            })
    }

    /// Send a bare command such as `STOP` or `SAVE`.
    pub async fn send_command(&self, tag: &str) -> Result<()> {
        self.send_raw(tag).await
    }

    /// Send `TAG=value` and remember it as the axis' current setting.
    pub async fn send_command_value(&self, tag: &str, value: i64) -> Result<()> {
        self.send_raw(&format!("{}={}", tag, value)).await?;
        self.state().store_setting(tag, value);
        Ok(())
    }

    /// Record a setting.
    ///
    /// Values from the settings file are converted to device units and only
    /// cached (see [`send_settings`](Self::send_settings)); anything else is
    /// sent immediately.
    pub async fn set_setting(&self, tag: &str, value: f64, from_file: bool) -> Result<()> {
        if from_file {
            let (tag, value) = file_value(tag, value, &self.stage);
            let mut state = self.state();
            if tag == POLLING_INTERVAL_TAG {
                state.polling_interval = value as i64;
            }
            state.store_setting(tag, value as i64);
            return Ok(());
        }
        self.send_command_value(tag, value as i64).await
    }

    /// Replay the cached settings in the order they were first set, then
    /// persist them on the controller.
    pub async fn send_settings(&self) -> Result<()> {
        let settings: Vec<(String, i64)> = self
            .state()
            .settings
            .iter()
            .filter(|(tag, _)| !MOTION_TAGS.contains(&tag.as_str()))
            .cloned()
            .collect();
        for (tag, value) in settings {
            self.send_raw(&format!("{}={}", tag, value)).await?;
        }
        self.send_raw("SAVE").await
    }

    pub fn setting(&self, tag: &str) -> Option<i64> {
        self.state().setting(tag)
    }

    pub fn settings(&self) -> Vec<(String, i64)> {
        self.state().settings.clone()
    }

    /// Last telemetry value received for `tag`.
    pub fn data(&self, tag: &str) -> Option<i64> {
        self.state().data.get(tag).copied()
    }

    /// Number of measured-position samples received so far.
    pub fn update_count(&self) -> u64 {
        self.state().update_count
    }

    pub fn polling_interval(&self) -> i64 {
        self.state().polling_interval
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.state().datum(TAG_STATUS))
    }

    pub fn has_status(&self, flag: Status) -> bool {
        self.status().contains(flag)
    }

    pub fn current_position(&self) -> Distance {
        let counts = self.state().datum(TAG_MEASURED_POSITION);
        Distance::from_encoder_counts(counts, self.stage.encoder_resolution)
    }

    pub fn target_position(&self) -> Distance {
        let counts = self.state().datum(TAG_DESIRED_POSITION);
        Distance::from_encoder_counts(counts, self.stage.encoder_resolution)
    }

    fn invalidate_target(&self) {
        self.state().was_valid_target = false;
    }

    /// Telemetry sink, called by the reader task for every routed sample.
    pub fn receive_data(&self, tag: &str, value: i64) {
        if tag == TAG_DEVICE_TIME {
            self.receive_data(TAG_HOST_TIME, chrono::Utc::now().timestamp_millis());
        }

        {
            let mut state = self.state();
            state.data.insert(tag.to_string(), value);
            if tag == TAG_MEASURED_POSITION {
                state.update_count += 1;
            }
        }

        // No subscribers is fine.
        let _ = self.events.send(TelemetryEvent {
            axis: self.letter,
            tag: tag.to_string(),
            value,
        });
    }

    /// Wait until `count` new position samples arrived.
    ///
    /// Returns false if telemetry stalls for longer than the update timeout.
    pub async fn wait_for_updates(&self, count: u64) -> bool {
        let start = self.update_count();
        let started = Instant::now();
        while self.update_count().saturating_sub(start) < count {
            if started.elapsed() > self.update_timeout {
                log::warn!(
                    "Axis {}: no telemetry for {:?}, giving up wait",
                    self.letter,
                    self.update_timeout
                );
                return false;
            }
            sleep(UPDATE_POLL).await;
        }
        true
    }

    /// Command a new target position.
    ///
    /// With force-waiting enabled, returns once the measured position is
    /// within tolerance and the controller reports position reached, or once
    /// `TOUT + TOU2` milliseconds have passed.
    pub async fn set_target_position(&self, target: Distance) -> Result<MotionOutcome> {
        let dpos = target.to_encoder_counts(self.stage.encoder_resolution);
        self.send_command_value(TAG_DESIRED_POSITION, dpos).await?;
        self.state().was_valid_target = true;

        if !self.force_waiting() {
            return Ok(MotionOutcome::Sent);
        }

        let timeout = self.motion_timeout();
        let sent = Instant::now();
        loop {
            if self.is_within_tolerance(dpos) && self.has_status(Status::POSITION_REACHED) {
                return Ok(MotionOutcome::Reached);
            }
            if sent.elapsed() > timeout {
                log::warn!(
                    "Axis {}: position {} not reached within {:?}",
                    self.letter,
                    target,
                    timeout
                );
                return Ok(MotionOutcome::TimedOut);
            }
            sleep(TARGET_POLL).await;
        }
    }

    /// Move by `delta` relative to the last commanded target if it is still
    /// valid, otherwise relative to the measured position.
    pub async fn step(&self, delta: Distance) -> Result<MotionOutcome> {
        let base = {
            let state = self.state();
            match state.setting(TAG_DESIRED_POSITION) {
                Some(counts) if state.was_valid_target => {
                    Distance::from_encoder_counts(counts, self.stage.encoder_resolution)
                }
                _ => Distance::from_encoder_counts(
                    state.datum(TAG_MEASURED_POSITION),
                    self.stage.encoder_resolution,
                ),
            }
        };

        let outcome = self.set_target_position(base + delta).await?;
        self.wait_for_updates(STEP_SETTLE_UPDATES).await;
        log::debug!("Axis {}: stepped {}", self.letter, delta);
        Ok(outcome)
    }

    /// Search for the encoder index. `direction` is -1, 0 or 1.
    pub async fn find_index(&self, direction: i32) -> Result<IndexOutcome> {
        log::debug!("Axis {}: searching index, status {:?}", self.letter, self.status());
        self.send_command_value("INDX", i64::from(direction)).await?;
        self.invalidate_target();

        loop {
            if self.has_status(Status::ENCODER_VALID) {
                log::info!("Index of axis {} found", self.letter);
                return Ok(IndexOutcome::Found);
            }
            if !self.wait_for_updates(STEP_SETTLE_UPDATES).await {
                return Ok(IndexOutcome::TimedOut);
            }
            if self.has_status(Status::ENCODER_VALID) {
                continue;
            }
            if !self.has_status(Status::SEARCHING_INDEX) {
                log::info!(
                    "Axis {}: index not found, controller stopped searching",
                    self.letter
                );
                return Ok(IndexOutcome::NotFound);
            }
            sleep(INDEX_POLL).await;
        }
    }

    pub async fn set_limits(&self, low: Distance, high: Distance) -> Result<()> {
        let resolution = self.stage.encoder_resolution;
        self.send_command_value("LLIM", low.to_encoder_counts(resolution))
            .await?;
        self.send_command_value("HLIM", high.to_encoder_counts(resolution))
            .await
    }

    /// Set the scan/move speed, given as distance per second, and persist it.
    pub async fn set_speed(&self, speed: Distance) -> Result<()> {
        let native = speed.get(Unit::Micrometer) as i64;
        self.send_command_value("SSPD", native).await?;
        self.send_command("SAVE").await
    }

    /// Move continuously in `direction` (-1, 0 or 1). A non-zero `duration`
    /// stops the scan again after that long.
    pub async fn start_scan(&self, direction: i32, duration: Duration) -> Result<()> {
        self.send_command_value("SCAN", i64::from(direction)).await?;
        self.invalidate_target();

        if !duration.is_zero() {
            sleep(duration).await;
            self.send_command_value("SCAN", 0).await?;
        }
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.send_command_value("SCAN", 0).await?;
        self.invalidate_target();
        Ok(())
    }

    pub async fn stop_movement(&self) -> Result<()> {
        self.send_command("STOP").await?;
        self.invalidate_target();
        Ok(())
    }

    pub async fn resume_movement(&self) -> Result<()> {
        self.send_command("CONT").await
    }

    /// Halt, zero the controller's target and reset.
    pub async fn stop(&self) -> Result<()> {
        self.send_command("STOP").await?;
        self.send_command("ZERO").await?;
        self.send_command("RSET").await?;
        self.invalidate_target();
        Ok(())
    }

    pub async fn reset(&self) -> Result<()> {
        self.send_command("RSET").await?;
        self.invalidate_target();
        Ok(())
    }

    /// Switch to the fastest telemetry rate.
    pub async fn start_logging(&self) -> Result<()> {
        self.set_setting(POLLING_INTERVAL_TAG, 1.0, false).await?;
        self.wait_for_updates(STEP_SETTLE_UPDATES).await;
        Ok(())
    }

    /// Restore the polling interval from the settings file.
    pub async fn end_logging(&self) -> Result<()> {
        let interval = self.polling_interval();
        self.set_setting(POLLING_INTERVAL_TAG, interval as f64, false)
            .await
    }

    /// Run the controller's frequency search and follow it until done.
    pub async fn calibrate(&self) -> Result<CalibrationOutcome> {
        self.send_command_value("FFRQ", 0).await?;
        self.invalidate_target();

        if !self.wait_for_updates(STEP_SETTLE_UPDATES).await {
            return Ok(CalibrationOutcome::TimedOut);
        }
        let (low, high) = {
            let state = self.state();
            (state.setting("LFRQ"), state.setting("HFRQ"))
        };

        log::info!("Axis {}: start calibrating", self.letter);
        let mut last_count = self.update_count();
        let mut last_progress = Instant::now();
        let mut last_reported = None;

        while self.has_status(Status::SEARCHING_OPTIMAL_FREQUENCY) {
            if let (Some(low), Some(high), Some(freq)) = (low, high, self.data(TAG_FREQUENCY)) {
                let span = high.saturating_sub(low);
                let progress = freq.saturating_sub(low).saturating_mul(100);
                if let Some(percent) = progress.checked_div(span) {
                    if percent % 10 == 0 && last_reported != Some(percent) {
                        log::info!("Axis {}: calibrating {}%", self.letter, percent);
                        last_reported = Some(percent);
                    }
                }
            }

            let count = self.update_count();
            if count != last_count {
                last_count = count;
                last_progress = Instant::now();
            } else if last_progress.elapsed() > self.update_timeout {
                log::warn!("Axis {}: telemetry stalled during calibration", self.letter);
                return Ok(CalibrationOutcome::TimedOut);
            }
            sleep(CALIBRATION_POLL).await;
        }

        log::info!("Axis {}: calibrating finished", self.letter);
        Ok(CalibrationOutcome::Finished)
    }

    fn motion_timeout(&self) -> Duration {
        let state = self.state();
        let millis = match (state.setting("TOUT"), state.setting("TOU2")) {
            (Some(tout), Some(tou2)) => tout + tou2,
            _ => DEFAULT_MOTION_TIMEOUT_MS,
        };
        Duration::from_millis(millis.max(0) as u64)
    }

    fn is_within_tolerance(&self, dpos: i64) -> bool {
        let state = self.state();
        let tolerance = match state.setting("PTO2") {
            Some(t) if t != 0 => t,
            _ => DEFAULT_POSITION_TOLERANCE,
        };
        let dpos = dpos.saturating_abs();
        let epos = state.datum(TAG_MEASURED_POSITION).saturating_abs();
        dpos.saturating_sub(tolerance) <= epos && epos <= dpos.saturating_add(tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis() -> Axis {
        let stage = Stage::lookup("XLA1=312").unwrap().clone();
        Axis::new('X', stage, Arc::new(SerialLink::new()), Duration::from_millis(200))
    }

    #[test]
    fn test_receive_data_counts_position_updates() {
        let axis = axis();
        let mut rx = axis.subscribe();
        axis.receive_data("EPOS", 500);
        axis.receive_data("STAT", 0x400);
        assert_eq!(axis.data("EPOS"), Some(500));
        assert_eq!(axis.update_count(), 1);
        assert!(axis.has_status(Status::POSITION_REACHED));
        assert!(!axis.has_status(Status::MOTOR_ON));

        let first = rx.try_recv().unwrap();
        assert_eq!((first.axis, first.tag.as_str(), first.value), ('X', "EPOS", 500));
    }

    #[test]
    fn test_time_synthesizes_host_clock() {
        let axis = axis();
        let before = chrono::Utc::now().timestamp_millis();
        axis.receive_data("TIME", 42);
        assert_eq!(axis.data("TIME"), Some(42));
        assert!(axis.data("PCTIME").unwrap() >= before);
    }

    #[test]
    fn test_positions_are_views_over_counts() {
        let axis = axis();
        axis.receive_data("EPOS", 3200);
        axis.receive_data("DPOS", -3200);
        assert_eq!(axis.current_position().get(Unit::Millimeter), 1.0);
        assert_eq!(axis.target_position().get(Unit::Millimeter), -1.0);
    }

    #[tokio::test]
    async fn test_file_settings_are_converted_and_cached() {
        let axis = axis();
        axis.set_setting("SSPD", 10.0, true).await.unwrap();
        axis.set_setting("MASS", 400.0, true).await.unwrap();
        axis.set_setting("POLI", 50.0, true).await.unwrap();
        axis.set_setting("SSPD", 12.0, true).await.unwrap();
        assert_eq!(axis.setting("SSPD"), Some(12_000));
        assert_eq!(axis.setting("CFRQ"), Some(10_000));
        assert_eq!(axis.setting("MASS"), None);
        assert_eq!(axis.polling_interval(), 50);
        let order: Vec<String> = axis.settings().into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec!["SSPD", "CFRQ", "POLI"]);
    }

    #[tokio::test]
    async fn test_commands_fail_without_link() {
        let axis = axis();
        assert!(matches!(axis.send_command("STOP").await, Err(DeviceError::NotConnected)));
        assert!(matches!(
            axis.set_setting("SSPD", 1.0, false).await,
            Err(DeviceError::NotConnected)
        ));
        assert_eq!(axis.setting("SSPD"), None);
    }

    #[test]
    fn test_tolerance_window() {
        let axis = axis();
        axis.receive_data("EPOS", 995);
        assert!(axis.is_within_tolerance(1000));
        axis.receive_data("EPOS", 989);
        assert!(!axis.is_within_tolerance(1000));
        axis.state().store_setting("PTO2", 20);
        assert!(axis.is_within_tolerance(1000));
    }

    #[test]
    fn test_tolerance_window_at_value_extremes() {
        let axis = axis();
        axis.receive_data("EPOS", i64::MIN);
        assert!(!axis.is_within_tolerance(1000));
        assert!(axis.is_within_tolerance(i64::MAX));
        axis.receive_data("EPOS", i64::MAX);
        assert!(axis.is_within_tolerance(i64::MIN));
    }

    #[test]
    fn test_motion_timeout_from_settings() {
        let axis = axis();
        assert_eq!(axis.motion_timeout(), Duration::from_millis(1000));
        axis.state().store_setting("TOUT", 300);
        assert_eq!(axis.motion_timeout(), Duration::from_millis(1000));
        axis.state().store_setting("TOU2", 200);
        assert_eq!(axis.motion_timeout(), Duration::from_millis(500));
    }
}
