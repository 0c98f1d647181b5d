#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use xeryon_core::serial::{Result, SerialError, SerialInterface, SerialPortIO};
use xeryon_core::ControllerOptions;

enum Incoming {
    Line(String),
    Fail,
}

/// Scripted controller on the other end of a fake serial line.
#[derive(Clone)]
pub struct FakeDevice {
    tx: mpsc::UnboundedSender<Incoming>,
    written: Arc<Mutex<Vec<String>>>,
}

struct ScriptedPort {
    rx: mpsc::UnboundedReceiver<Incoming>,
    written: Arc<Mutex<Vec<String>>>,
    pending: Vec<u8>,
    failed: bool,
}

fn unplugged() -> SerialError {
    SerialError::IoError(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "device unplugged",
    ))
}

#[async_trait::async_trait]
impl SerialPortIO for ScriptedPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.written
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).to_string());
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        if self.failed {
            return Err(unplugged());
        }
        if self.pending.is_empty() {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), self.rx.recv()).await {
                Ok(Some(Incoming::Line(line))) => {
                    self.pending = format!("{}\n", line).into_bytes();
                    // Hand over everything queued so telemetry never lags.
                    while let Ok(next) = self.rx.try_recv() {
                        match next {
                            Incoming::Line(line) => {
                                self.pending.extend_from_slice(format!("{}\n", line).as_bytes())
                            }
                            Incoming::Fail => {
                                self.failed = true;
                                break;
                            }
                        }
                    }
                }
                Ok(Some(Incoming::Fail)) => return Err(unplugged()),
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    return Err(SerialError::Timeout);
                }
                Err(_) => return Err(SerialError::Timeout),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FakeDevice {
    pub fn new() -> (Self, SerialInterface) {
        let (tx, rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let port = ScriptedPort {
            rx,
            written: written.clone(),
            pending: Vec::new(),
            failed: false,
        };
        (Self { tx, written }, SerialInterface::from_io(Box::new(port)))
    }

    /// Queue a line as if the controller had sent it.
    pub fn send(&self, line: &str) {
        let _ = self.tx.send(Incoming::Line(line.to_string()));
    }

    /// Make the next read fail like an unplugged cable.
    pub fn fail(&self) {
        let _ = self.tx.send(Incoming::Fail);
    }

    /// Every line written to the device so far.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn wrote(&self, line: &str) -> bool {
        self.written().iter().any(|l| l == line)
    }

    /// Stream telemetry every 10 ms. The script sees the tick number and the
    /// commands written so far.
    pub fn pump<F>(&self, mut script: F) -> JoinHandle<()>
    where
        F: FnMut(u64, &[String]) -> Vec<String> + Send + 'static,
    {
        let device = self.clone();
        tokio::spawn(async move {
            let mut tick = 0u64;
            loop {
                for line in script(tick, &device.written()) {
                    device.send(&line);
                }
                tick += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    }
}

/// Poll `check` every 5 ms until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(check: F, limit: Duration) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < limit {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Write a settings resource to a temp dir.
pub fn settings_file(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("settings_default.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

pub fn test_options(settings: PathBuf) -> ControllerOptions {
    ControllerOptions {
        settings_file: settings,
        reader_poll_ms: 10,
        reset_settle_ms: 10,
        update_timeout_ms: 1000,
        ..ControllerOptions::default()
    }
}
