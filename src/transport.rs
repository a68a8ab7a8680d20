//! Gateway enumeration and the byte-stream session used to talk to one.
//!
//! The reference implementation treats the serial wrapper as an
//! inheritance root that subclasses mix protocol state into. Here it
//! is a trait with four methods and nothing else; a [`crate::module_flasher::ModuleFlasher`]
//! or [`crate::esp_flasher::EspFlasher`] holds one by exclusive ownership instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// USB vendor/product id pair gateways enumerate under.
pub const GATEWAY_VID: u16 = 0x2FDE;
/// USB vendor/product id pair gateways enumerate under.
pub const GATEWAY_PID: u16 = 0x0003;

/// Baud rate every gateway session is opened at.
pub const BAUD_RATE: u32 = 921_600;
/// Read timeout applied to every gateway session.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Which OS-level handle a discovered gateway was reached through.
///
/// Carried for diagnostics only; flashing logic never branches on it; on
/// Unix this always reads [`PortKind::Serial`] since the platform has no
/// separate WinUSB handle class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// A plain OS serial port (COM port / tty).
    Serial,
    /// A WinUSB-class handle to the same VID/PID.
    WinUsb,
}

/// One enumerated gateway, not yet opened.
#[derive(Debug, Clone)]
pub struct GatewayPort {
    /// OS path or identifier used to open the port.
    pub path: String,
    /// Which handle class this was discovered through.
    pub kind: PortKind,
}

/// Scans system serial ports for gateways matching `(GATEWAY_VID, GATEWAY_PID)`.
///
/// Ports this process cannot query (permission errors, transient
/// enumeration failures) are skipped rather than treated as fatal;
/// enumeration only fails if the OS call itself fails outright.
pub fn enumerate_gateways() -> Result<Vec<GatewayPort>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| {
        TransportError::Io(std::io::Error::other(e.to_string()))
    })?;
    let gateways = ports
        .into_iter()
        .filter(|p| {
            matches!(
                &p.port_type,
                serialport::SerialPortType::UsbPort(info)
                    if info.vid == GATEWAY_VID && info.pid == GATEWAY_PID
            )
        })
        .map(|p| GatewayPort {
            path: p.port_name,
            kind: PortKind::Serial,
        })
        .collect();
    Ok(gateways)
}

/// A byte-oriented session to one gateway.
///
/// Mirrors the four operations the redesign note calls for: `read`,
/// `read_until`, `write`, `close`. No protocol state lives here.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reads up to `max_len` bytes. Short reads (including zero bytes
    /// on a read-timeout) are permitted and are not an error.
    async fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Reads until `terminator` is seen or `deadline` elapses, returning
    /// everything read so far (including a trailing partial match) when
    /// the deadline elapses without seeing it.
    async fn read_until(&self, terminator: u8, deadline: Duration) -> Result<Vec<u8>, TransportError>;

    /// Writes every byte of `data`, blocking the caller until accepted
    /// by the OS write buffer.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Closes the session. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A [`Transport`] backed by a real OS serial port.
pub struct SerialTransport {
    port: Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>,
    kind: PortKind,
}

impl SerialTransport {
    /// Opens `gateway` at [`BAUD_RATE`] 8N1 with [`READ_TIMEOUT`] and no
    /// write timeout.
    pub fn open(gateway: &GatewayPort) -> Result<Self, TransportError> {
        let port = serialport::new(&gateway.path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => TransportError::NotPresent,
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PortBusy
                }
                _ => TransportError::Io(std::io::Error::other(e.to_string())),
            })?;
        log::debug!("opened {} at {BAUD_RATE} baud", gateway.path);
        Ok(Self {
            port: Arc::new(Mutex::new(Some(port))),
            kind: gateway.kind,
        })
    }

    /// Which handle class this session was opened through.
    pub fn kind(&self) -> PortKind {
        self.kind
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let port = self.port.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().expect("serial port mutex poisoned");
            let port = guard.as_mut().ok_or(TransportError::Closed)?;
            let mut buf = vec![0u8; max_len.max(1)];
            match std::io::Read::read(port, &mut buf) {
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(TransportError::Io(e)),
            }
        })
        .await
        .expect("blocking read task panicked")
    }

    async fn read_until(&self, terminator: u8, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let start = tokio::time::Instant::now();
        let mut collected = Vec::new();
        loop {
            let chunk = self.read(256).await?;
            if chunk.is_empty() {
                if start.elapsed() >= deadline {
                    return Ok(collected);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
            if let Some(pos) = chunk.iter().position(|&b| b == terminator) {
                collected.extend_from_slice(&chunk[..=pos]);
                return Ok(collected);
            }
            collected.extend_from_slice(&chunk);
            if start.elapsed() >= deadline {
                return Ok(collected);
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.lock().expect("serial port mutex poisoned");
            let port = guard.as_mut().ok_or(TransportError::Closed)?;
            std::io::Write::write_all(port, &data).map_err(TransportError::Io)
        })
        .await
        .expect("blocking write task panicked")
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut guard = self.port.lock().expect("serial port mutex poisoned");
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_vid_pid_match_the_enumeration_contract() {
        assert_eq!(GATEWAY_VID, 0x2FDE);
        assert_eq!(GATEWAY_PID, 0x0003);
    }

    #[test]
    fn baud_rate_matches_the_wire_contract() {
        assert_eq!(BAUD_RATE, 921_600);
    }
}
