pub mod interface;
pub mod protocol;
pub mod reader;

pub use interface::{SerialInterface, SerialLink};
pub use protocol::{LineBuffer, TaggedLine, Telemetry};

/// Byte-level access to an open transport.
///
/// The native implementation wraps a `serialport` handle; tests substitute a
/// scripted device through [`SerialInterface::from_io`].
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    /// Write all of `data` to the transport.
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available, waiting at most `timeout_ms`.
    ///
    /// Returns [`SerialError::Timeout`] when nothing arrived in time.
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;

    async fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
