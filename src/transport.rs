//! Duplex byte transports to the robot (§4.B): serial and TCP variants
//! behind a single async trait.

use crate::error::TransportError;
use async_trait::async_trait;
#[cfg(feature = "serial")]
use std::io::{Read, Write};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

pub type Result<T> = std::result::Result<T, TransportError>;

/// A duplex byte channel to the robot. No application framing is performed
/// here; callers push raw bytes through a [`crate::frame::FrameDecoder`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn send(&self, bytes: &[u8]) -> Result<()>;
    /// Returns the next chunk of bytes read off the wire, or `None` once the
    /// transport has been closed and its reader task has drained.
    async fn try_recv(&self) -> Option<Vec<u8>>;
    async fn close(&self) -> Result<()>;
}

/// TCP transport (`robot.host`/`robot.port`).
pub struct TcpTransport {
    addr: String,
    state: Mutex<Option<TcpState>>,
}

struct TcpState {
    write_half: tokio::net::tcp::OwnedWriteHalf,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host.into(), port),
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        *self.state.lock().await = Some(TcpState { write_half, rx });
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(TransportError::NotConnected)?;
        state.write_half.write_all(bytes).await?;
        Ok(())
    }

    async fn try_recv(&self) -> Option<Vec<u8>> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut()?;
        state.rx.recv().await
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock().await = None;
        Ok(())
    }
}

/// Serial transport (`robot.serialPath`/`robot.baud`), 8N1.
///
/// The `serialport` crate is synchronous; reads and writes are dispatched
/// through `spawn_blocking`, the same pattern the reference daemon uses for
/// its own blocking socket calls inside async methods.
#[cfg(feature = "serial")]
pub struct SerialTransport {
    path: String,
    baud: u32,
    state: Mutex<Option<SerialState>>,
}

#[cfg(feature = "serial")]
struct SerialState {
    port: Box<dyn serialport::SerialPort>,
    rx: mpsc::Receiver<Vec<u8>>,
    shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(feature = "serial")]
impl SerialTransport {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            state: Mutex::new(None),
        }
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&self) -> Result<()> {
        let path = self.path.clone();
        let baud = self.baud;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(path, baud)
                .timeout(Duration::from_millis(100))
                .open()
        })
        .await
        .map_err(|_| TransportError::Closed)?
        .map_err(|e| TransportError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let mut reader = port.try_clone().map_err(|e| {
            TransportError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        let (tx, rx) = mpsc::channel(64);
        let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader_shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                if reader_shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(_) => break,
                }
            }
        });

        *self.state.lock().await = Some(SerialState { port, rx, shutdown });
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let mut port = state.port.try_clone().map_err(|e| {
            TransportError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e))
        })?;
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || port.write_all(&bytes))
            .await
            .map_err(|_| TransportError::Closed)??;
        Ok(())
    }

    async fn try_recv(&self) -> Option<Vec<u8>> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut()?;
        state.rx.recv().await
    }

    async fn close(&self) -> Result<()> {
        if let Some(state) = self.state.lock().await.take() {
            state.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    }
}
