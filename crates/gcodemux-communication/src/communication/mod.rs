//! Transport layer
//!
//! A connection to a controller is a [`SerialLink`]: an outbound byte channel
//! drained by a writer thread, and an inbound stream of framed lines produced
//! by a reader thread. [`PortOpener`] is the seam between the engine and the
//! operating system, so tests can substitute a firmware simulator.

pub mod buffered;
pub mod framing;
pub mod serial;

use gcodemux_core::ConnectionError;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

pub use buffered::{
    Lane, OutgoingCommand, Released, Retired, StreamingConfig, StreamingSender,
};
pub use framing::LineFramer;
pub use serial::{list_ports, SerialPortInfo, SerialPortOpener};

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Parameters for opening a serial device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Device path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Hardware flow control
    pub flow_control: bool,
    /// Read timeout of the reader thread in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
            timeout_ms: 20,
        }
    }
}

impl ConnectionParams {
    /// 8N1 parameters for a device at a baud rate
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Reject parameters no device can be opened with
    pub fn validate(&self) -> Result<(), ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidParameters { reason };

        if self.port.trim().is_empty() {
            return Err(invalid("port path is empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud rate must be > 0".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(invalid(format!("invalid data bits: {}", self.data_bits)));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(invalid(format!("invalid stop bits: {}", self.stop_bits)));
        }
        Ok(())
    }
}

/// Inbound traffic from an open device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One line, terminator stripped
    Line(String),
    /// The device went away; `Some` carries the I/O failure
    Closed(Option<String>),
}

/// An open device
///
/// Dropping `outbound` closes the device; [`SerialLink::close`] also waits
/// until every I/O worker has let go of it.
#[derive(Debug)]
pub struct SerialLink {
    /// Bytes to write, in order
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Lines read, in arrival order
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    released: Vec<oneshot::Receiver<()>>,
}

impl SerialLink {
    /// Link over a pair of channels
    pub fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            outbound,
            events,
            released: Vec::new(),
        }
    }

    /// Register a worker holding the device
    ///
    /// The worker drops its sender once the device handle it owns is closed.
    pub fn holds_device(mut self, released: oneshot::Receiver<()>) -> Self {
        self.released.push(released);
        self
    }

    /// Close the device and wait until no worker holds it
    pub async fn close(self) {
        let Self {
            outbound,
            events,
            released,
        } = self;
        drop(outbound);
        drop(events);
        for worker in released {
            // Sender dropped without a value: the worker is gone either way
            let _ = worker.await;
        }
    }
}

/// Opens devices and enumerates candidates
///
/// `open` may block; callers run it on a blocking thread.
pub trait PortOpener: Send + Sync + 'static {
    /// Open a device
    fn open(&self, params: &ConnectionParams) -> Result<SerialLink, ConnectionError>;

    /// Devices that look like CNC controllers
    fn list(&self) -> Result<Vec<SerialPortInfo>, ConnectionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_close_waits_for_workers() {
        let (outbound, mut writes) = mpsc::unbounded_channel::<Vec<u8>>();
        let (_device, events) = mpsc::unbounded_channel();
        let (done, released) = oneshot::channel();
        let link = SerialLink::new(outbound, events).holds_device(released);

        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn({
            let closed = closed.clone();
            async move {
                while writes.recv().await.is_some() {}
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                closed.store(true, Ordering::SeqCst);
                drop(done);
            }
        });

        link.close().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_params_validation() {
        assert!(ConnectionParams::serial("COM3", 115200).validate().is_ok());
        assert!(ConnectionParams::serial("", 115200).validate().is_err());
        assert!(ConnectionParams::serial("COM3", 0).validate().is_err());

        let mut params = ConnectionParams::serial("COM3", 115200);
        params.stop_bits = 3;
        assert!(matches!(
            params.validate(),
            Err(ConnectionError::InvalidParameters { .. })
        ));
    }
}
