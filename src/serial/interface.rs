use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::protocol::encode_command;
use super::{Result, SerialError, SerialPortIO};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// `SerialPortIO` over a native serial port handle.
struct NativePort {
    port: Box<dyn SerialPort>,
}

#[async_trait::async_trait]
impl SerialPortIO for NativePort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).map_err(SerialError::IoError)?;
        Ok(())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port = &mut self.port;

        let read_operation = async {
            loop {
                match port.bytes_to_read() {
                    Ok(0) => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(_) => match port.read(buffer) {
                        Ok(0) => tokio::time::sleep(Duration::from_millis(5)).await,
                        Ok(bytes_read) => return Ok(bytes_read),
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => return Err(SerialError::IoError(e)),
                    },
                    Err(e) => return Err(SerialError::SerialportError(e)),
                }
            }
        };

        timeout(Duration::from_millis(timeout_ms), read_operation)
            .await
            .map_err(|_| SerialError::Timeout)?
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(SerialError::IoError)
    }
}

/// One open transport plus the name it was opened under.
pub struct SerialInterface {
    io: Box<dyn SerialPortIO>,
    port_name: String,
}

impl SerialInterface {
    /// Open `port_name` with the controller's fixed framing: 8 data bits,
    /// 1 stop bit, no parity, no flow control.
    pub fn connect(port_name: &str, baud_rate: u32, timeout_ms: u64) -> Result<Self> {
        if port_name.is_empty() {
            return Err(SerialError::PortNotFound(port_name.to_string()));
        }

        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(timeout_ms))
            .open()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;

        // Drop whatever the device queued before we attached.
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            log::debug!("Could not clear buffers on {}: {}", port_name, e);
        }

        log::info!("Serial port {} opened at {} baud", port_name, baud_rate);
        Ok(Self {
            io: Box::new(NativePort { port }),
            port_name: port_name.to_string(),
        })
    }

    /// Wrap an arbitrary transport, e.g. a scripted device in tests.
    pub fn from_io(io: Box<dyn SerialPortIO>) -> Self {
        Self {
            io,
            port_name: String::from("<custom>"),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Write one encoded line and flush it.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.io.send_data(line.as_bytes()).await?;
        self.io.flush().await
    }

    pub async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        self.io.read_data(buffer, timeout_ms).await
    }
}

/// The transport shared between the reader task and command issuers.
///
/// Every write and every read goes through the same lock, so lines from
/// concurrent callers never interleave on the wire.
pub struct SerialLink {
    interface: Mutex<Option<SerialInterface>>,
    axis_count: AtomicUsize,
}

impl SerialLink {
    pub fn new() -> Self {
        Self {
            interface: Mutex::new(None),
            axis_count: AtomicUsize::new(0),
        }
    }

    pub async fn attach(&self, interface: SerialInterface) {
        let mut guard = self.interface.lock().await;
        *guard = Some(interface);
    }

    pub async fn detach(&self) -> Option<SerialInterface> {
        self.interface.lock().await.take()
    }

    pub async fn is_attached(&self) -> bool {
        self.interface.lock().await.is_some()
    }

    pub fn set_axis_count(&self, count: usize) {
        self.axis_count.store(count, Ordering::SeqCst);
    }

    pub fn is_single_axis(&self) -> bool {
        self.axis_count.load(Ordering::SeqCst) <= 1
    }

    /// Send `command` (already `TAG` or `TAG=value`) addressed to `letter`.
    pub async fn send_command(&self, letter: Option<char>, command: &str) -> Result<()> {
        let line = encode_command(letter, self.is_single_axis(), command);
        log::debug!("Sending command: {}", line.trim_end());

        let mut guard = self.interface.lock().await;
        let interface = guard.as_mut().ok_or(SerialError::NotConnected)?;
        interface.send_line(&line).await.map_err(|e| {
            log::error!("Failed to send command {}: {}", line.trim_end(), e);
            e
        })
    }

    pub async fn read_chunk(&self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let mut guard = self.interface.lock().await;
        let interface = guard.as_mut().ok_or(SerialError::NotConnected)?;
        interface.read_data(buffer, timeout_ms).await
    }
}

impl Default for SerialLink {
    fn default() -> Self {
        Self::new()
    }
}
