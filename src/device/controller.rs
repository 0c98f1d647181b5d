use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{Axis, ConnectionState, DeviceError, Result, Stage};
use crate::config::{ControllerOptions, Settings};
use crate::serial::reader::{reader_task, ReaderExit};
use crate::serial::{SerialError, SerialInterface, SerialLink};

const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The background reader of one connection.
struct ReaderSession {
    task_handle: JoinHandle<ReaderExit>,
    stop_tx: mpsc::Sender<()>,
}

/// Owns the serial link, the registered axes and the loaded settings.
pub struct Controller {
    options: ControllerOptions,
    port: Mutex<String>,
    link: Arc<SerialLink>,
    axes: Arc<RwLock<Vec<Arc<Axis>>>>,
    settings: Mutex<Option<Settings>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    session: tokio::sync::Mutex<Option<ReaderSession>>,
}

impl Controller {
    /// Create a controller. The settings file must exist.
    pub fn new(options: ControllerOptions) -> Result<Self> {
        if !options.settings_file.exists() {
            return Err(DeviceError::SettingsNotFound(options.settings_file.clone()));
        }
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            port: Mutex::new(options.port.clone()),
            options,
            link: Arc::new(SerialLink::new()),
            axes: Arc::new(RwLock::new(Vec::new())),
            settings: Mutex::new(None),
            state_tx: Arc::new(state_tx),
            session: tokio::sync::Mutex::new(None),
        })
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    /// The port the next [`connect`](Self::connect) opens.
    pub fn port(&self) -> String {
        self.lock_port().clone()
    }

    /// Point the controller at another settings file. Ignored if it does
    /// not exist; cached settings are dropped otherwise.
    pub fn set_settings_file(&mut self, path: &Path) {
        if path.exists() {
            self.options.settings_file = path.to_path_buf();
            *self.lock_settings() = None;
        } else {
            log::warn!(
                "Settings file {} does not exist, keeping {}",
                path.display(),
                self.options.settings_file.display()
            );
        }
    }

    /// Register an axis using the stage named in the settings file.
    pub fn add_axis(&self, letter: char) -> Result<Arc<Axis>> {
        let stage = self.model()?;
        self.add_axis_with_stage(letter, stage.clone())
    }

    pub fn add_axis_with_stage(&self, letter: char, stage: Stage) -> Result<Arc<Axis>> {
        let mut axes = self.write_axes();
        if axes.iter().any(|axis| axis.letter() == letter) {
            return Err(DeviceError::InvalidConfiguration(format!(
                "axis {} already registered",
                letter
            )));
        }
        let update_timeout = Duration::from_millis(self.options.update_timeout_ms);
        let axis = Arc::new(Axis::new(letter, stage, self.link.clone(), update_timeout));
        axes.push(axis.clone());
        self.link.set_axis_count(axes.len());
        log::info!("Registered axis {} ({})", letter, axis.stage().command);
        Ok(axis)
    }

    pub fn axis(&self, letter: char) -> Option<Arc<Axis>> {
        self.read_axes()
            .iter()
            .find(|axis| axis.letter() == letter)
            .cloned()
    }

    pub fn axes(&self) -> Vec<Arc<Axis>> {
        self.read_axes().clone()
    }

    pub fn is_single_axis_system(&self) -> bool {
        self.link.is_single_axis()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    /// Watch connection changes, including link failures seen by the reader.
    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                log::debug!("Connection state {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    /// Open the serial port (optionally a different one) and start reading.
    /// An existing connection is torn down first.
    pub async fn connect(&self, port: Option<&str>) -> Result<()> {
        let port = {
            let mut current = self.lock_port();
            if let Some(port) = port {
                *current = port.to_string();
            }
            current.clone()
        };
        self.disconnect().await;
        self.set_state(ConnectionState::Connecting);

        match SerialInterface::connect(&port, self.options.baud_rate, self.options.timeout_ms) {
            Ok(interface) => {
                self.start_session(interface).await;
                Ok(())
            }
            Err(e) => {
                log::error!("Connection to {} failed: {}", port, e);
                self.set_state(ConnectionState::Error(e.to_string()));
                Err(DeviceError::SerialError(e))
            }
        }
    }

    /// Attach an already open transport, e.g. a scripted one in tests.
    pub async fn connect_with(&self, interface: SerialInterface) {
        self.disconnect().await;
        self.set_state(ConnectionState::Connecting);
        self.start_session(interface).await;
    }

    async fn start_session(&self, interface: SerialInterface) {
        log::info!("Connected on {}", interface.port_name());
        self.link.attach(interface).await;
        // Published before the reader runs so a link failure it reports wins.
        self.set_state(ConnectionState::Connected);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task_handle = tokio::spawn(reader_task(
            self.link.clone(),
            self.axes.clone(),
            stop_rx,
            self.state_tx.clone(),
            self.options.reader_poll_ms,
        ));

        *self.session.lock().await = Some(ReaderSession {
            task_handle,
            stop_tx,
        });
    }

    /// Stop the reader, wait for it to drain, then close the transport.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            if self.link.detach().await.is_some() {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        };

        let failed = matches!(self.connection_state(), ConnectionState::Error(_));
        if !failed {
            self.set_state(ConnectionState::Disconnecting);
        }
        let ReaderSession {
            mut task_handle,
            stop_tx,
        } = session;
        let _ = stop_tx.send(()).await;
        match timeout(READER_JOIN_TIMEOUT, &mut task_handle).await {
            Ok(Ok(exit)) => log::debug!("Reader exited: {:?}", exit),
            Ok(Err(e)) => log::warn!("Reader task ended abnormally: {}", e),
            Err(_) => {
                log::warn!(
                    "Reader task did not stop within {:?}, aborting",
                    READER_JOIN_TIMEOUT
                );
                task_handle.abort();
            }
        }

        if let Some(interface) = self.link.detach().await {
            log::info!("Disconnected from {}", interface.port_name());
        }
        if !failed {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Connect and bring every axis to the configured state.
    pub async fn start(&self) -> Result<()> {
        let no_axes = self.read_axes().is_empty();
        if no_axes {
            log::warn!("Cannot start without any axis registered");
            return Err(DeviceError::NoAxes);
        }
        self.connect(None).await?;
        self.reset().await
    }

    /// Stop every axis and disconnect.
    pub async fn shutdown(&self) {
        if !self.is_connected() {
            return;
        }
        for axis in self.axes() {
            if let Err(e) = axis.stop().await {
                log::warn!("Failed to stop axis {}: {}", axis.letter(), e);
            }
        }
        self.disconnect().await;
    }

    /// Write one command line; the axis letter is added on multi-axis systems.
    pub async fn send_command(&self, axis: Option<char>, command: &str) -> Result<()> {
        self.link
            .send_command(axis, command)
            .await
            .map_err(|e| match e {
                SerialError::NotConnected => DeviceError::NotConnected,
                other => DeviceError::SerialError(other),
            })
    }

    /// Reset every axis, then replay the settings file onto them and save.
    pub async fn reset(&self) -> Result<()> {
        for axis in self.axes() {
            axis.reset().await?;
        }
        tokio::time::sleep(Duration::from_millis(self.options.reset_settle_ms)).await;

        self.read_settings().await?;
        for axis in self.axes() {
            axis.send_settings().await?;
        }
        Ok(())
    }

    pub async fn stop_movements(&self) -> Result<()> {
        for axis in self.axes() {
            axis.stop_movement().await?;
        }
        Ok(())
    }

    /// Re-read the settings file.
    pub fn load_settings(&self) -> Result<()> {
        let settings = Settings::load(&self.options.settings_file)?;
        *self.lock_settings() = Some(settings);
        Ok(())
    }

    /// The loaded settings, reading the file on first use.
    pub fn settings(&self) -> Result<Settings> {
        let mut guard = self.lock_settings();
        if let Some(settings) = guard.as_ref() {
            return Ok(settings.clone());
        }
        let settings = Settings::load(&self.options.settings_file)?;
        *guard = Some(settings.clone());
        Ok(settings)
    }

    /// Apply every settings entry to its axis cache, in file order.
    pub async fn read_settings(&self) -> Result<()> {
        let settings = self.settings()?;
        let axes = self.axes();
        let Some(first) = axes.first() else {
            return Ok(());
        };

        for entry in settings.entries() {
            let axis = match entry.axis {
                None => Some(first),
                Some(letter) => axes.iter().find(|axis| axis.letter() == letter),
            };
            match axis {
                Some(axis) => axis.set_setting(&entry.tag, entry.value, true).await?,
                None => log::debug!("No axis for setting {:?}", entry),
            }
        }
        Ok(())
    }

    /// First raw value for `tag` in the settings file.
    pub fn try_get_setting(&self, tag: &str) -> Option<f64> {
        self.settings().ok()?.get(tag)
    }

    /// The stage model declared in the settings file.
    pub fn model(&self) -> Result<&'static Stage> {
        self.settings()?.model()
    }

    fn lock_port(&self) -> std::sync::MutexGuard<'_, String> {
        match self.port.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_settings(&self) -> std::sync::MutexGuard<'_, Option<Settings>> {
        match self.settings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_axes(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Axis>>> {
        match self.axes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_axes(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Axis>>> {
        match self.axes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
