//! Background reader: drains the transport and routes telemetry to axes.
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::protocol::{parse_telemetry, LineBuffer};
use super::{SerialError, SerialLink};
use crate::device::{Axis, ConnectionState};

/// Pause between reads so command writers get the link lock.
const INTER_READ_YIELD_MS: u64 = 5;

/// Why the reader loop ended.
#[derive(Debug)]
pub enum ReaderExit {
    /// A disconnect was requested.
    Stopped,
    /// The transport failed underneath us.
    LinkFailed(String),
}

pub(crate) async fn reader_task(
    link: Arc<SerialLink>,
    axes: Arc<RwLock<Vec<Arc<Axis>>>>,
    mut stop_rx: mpsc::Receiver<()>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    poll_ms: u64,
) -> ReaderExit {
    use tokio::select;
    use tokio::time::sleep;

    log::info!("Reader task started");
    let mut lines = LineBuffer::new();

    let exit = loop {
        select! {
            _ = stop_rx.recv() => {
                break ReaderExit::Stopped;
            },
            read_res = async {
                let mut buf = [0u8; 512];
                link.read_chunk(&mut buf, poll_ms).await.map(|n| (buf, n))
            } => {
                match read_res {
                    Ok((buf, n)) if n > 0 => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        for line in lines.push(&chunk) {
                            let guard = match axes.read() {
                                Ok(guard) => guard,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            dispatch_line(&line, &guard);
                        }
                    },
                    Ok(_) | Err(SerialError::Timeout) => {},
                    Err(e) => {
                        log::warn!("Serial link error, reader stopping: {}", e);
                        break ReaderExit::LinkFailed(e.to_string());
                    }
                }
            },
        }
        sleep(Duration::from_millis(INTER_READ_YIELD_MS)).await;
    };

    if let ReaderExit::LinkFailed(reason) = &exit {
        state_tx.send_replace(ConnectionState::Error(reason.clone()));
    }
    log::info!("Reader task stopped ({:?})", exit);
    exit
}

/// Decode one line and hand it to the addressed axis.
///
/// Lines without a letter go to the first registered axis. Undecodable lines
/// and lines for unknown axes are dropped. Returns whether an axis took it.
pub fn dispatch_line(line: &str, axes: &[Arc<Axis>]) -> bool {
    let Some(telemetry) = parse_telemetry(line) else {
        log::debug!("Skipping unrecognised line: {:?}", line);
        return false;
    };

    let target = match telemetry.letter {
        None => axes.first(),
        Some(letter) => axes.iter().find(|axis| axis.letter() == letter),
    };

    match target {
        Some(axis) => {
            axis.receive_data(&telemetry.tag, telemetry.value);
            true
        }
        None => {
            log::debug!("No axis registered for line: {:?}", line);
            false
        }
    }
}
