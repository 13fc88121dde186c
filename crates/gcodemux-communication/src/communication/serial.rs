//! Serial port communication implementation
//!
//! Opens devices through the `serialport` crate and turns them into a
//! [`SerialLink`]:
//! - a reader thread frames incoming bytes into lines
//! - a writer thread drains the outbound channel in order
//!
//! Port enumeration filters by known USB vendor/product ids, with an opt-in
//! fallback on port name patterns.

use super::{ConnectionParams, LinkEvent, PortOpener, SerialLink, SerialParity};
use crate::communication::framing::LineFramer;
use gcodemux_core::ConnectionError;
use gcodemux_settings::DeviceSettings;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }

    fn from_serialport(port: &serialport::SerialPortInfo) -> Self {
        let info = Self::new(&port.port_name, port_description(port));
        match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                let mut info = info.with_usb_ids(usb.vid, usb.pid);
                info.manufacturer = usb.manufacturer.clone();
                info.serial_number = usb.serial_number.clone();
                info
            }
            _ => info,
        }
    }
}

/// List serial ports that look like CNC controllers
pub fn list_ports(devices: &DeviceSettings) -> Result<Vec<SerialPortInfo>, ConnectionError> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        ConnectionError::Transport {
            port: "*".to_string(),
            reason: format!("failed to enumerate ports: {}", e),
        }
    })?;

    Ok(ports
        .iter()
        .map(SerialPortInfo::from_serialport)
        .filter(|info| is_controller(info, devices))
        .collect())
}

fn is_controller(info: &SerialPortInfo, devices: &DeviceSettings) -> bool {
    match (info.vid, info.pid) {
        (Some(vid), Some(pid)) if devices.is_known(vid, pid) => true,
        _ => devices.match_port_names && is_valid_cnc_port(&info.port_name),
    }
}

/// Check if a port name matches CNC controller patterns
///
/// - Windows: COM* (COM1, COM2, etc.)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
fn is_valid_cnc_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    ["/dev/ttyUSB", "/dev/ttyACM", "/dev/cu.usbserial-", "/dev/cu.usbmodem"]
        .iter()
        .any(|prefix| port_name.starts_with(prefix))
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

fn open_error(port: &str, err: serialport::Error) -> ConnectionError {
    let busy = matches!(
        err.kind(),
        serialport::ErrorKind::Io(io::ErrorKind::ResourceBusy)
    ) || err.to_string().to_ascii_lowercase().contains("busy");

    if busy {
        ConnectionError::PortUnavailable {
            port: port.to_string(),
            reason: "device is in use by another process".to_string(),
        }
    } else {
        ConnectionError::Transport {
            port: port.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Opens real serial devices
#[derive(Debug, Clone, Default)]
pub struct SerialPortOpener {
    devices: DeviceSettings,
}

impl SerialPortOpener {
    /// Create an opener that lists the given devices
    pub fn new(devices: DeviceSettings) -> Self {
        Self { devices }
    }
}

impl PortOpener for SerialPortOpener {
    fn open(&self, params: &ConnectionParams) -> Result<SerialLink, ConnectionError> {
        params.validate()?;

        let data_bits = match params.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let stop_bits = match params.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };

        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(Duration::from_millis(params.timeout_ms))
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(to_serialport_parity(params.parity))
            .flow_control(if params.flow_control {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            })
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                open_error(&params.port, e)
            })?;

        let reader = port
            .try_clone()
            .map_err(|e| open_error(&params.port, e))?;

        tracing::info!("Opened {} at {} baud", params.port, params.baud_rate);
        spawn_link(&params.port, reader, port)
    }

    fn list(&self) -> Result<Vec<SerialPortInfo>, ConnectionError> {
        list_ports(&self.devices)
    }
}

/// Wire a reader and a writer to a new [`SerialLink`]
///
/// The link closes when the outbound sender is dropped or the device fails.
/// Each thread drops its handle on the device before signalling release.
pub fn spawn_link<R, W>(port: &str, reader: R, writer: W) -> Result<SerialLink, ConnectionError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let stop = Arc::new(AtomicBool::new(false));
    let (reader_done, reader_released) = oneshot::channel::<()>();
    let (writer_done, writer_released) = oneshot::channel::<()>();

    let spawn_error = |e: io::Error| ConnectionError::Transport {
        port: port.to_string(),
        reason: format!("failed to start I/O thread: {}", e),
    };

    std::thread::Builder::new()
        .name(format!("serial-rx {}", port))
        .spawn({
            let events = event_tx.clone();
            let stop = stop.clone();
            move || {
                read_loop(reader, events, stop);
                drop(reader_done);
            }
        })
        .map_err(spawn_error)?;

    std::thread::Builder::new()
        .name(format!("serial-tx {}", port))
        .spawn(move || {
            write_loop(writer, out_rx, event_tx, stop);
            drop(writer_done);
        })
        .map_err(spawn_error)?;

    Ok(SerialLink::new(out_tx, event_rx)
        .holds_device(reader_released)
        .holds_device(writer_released))
}

fn read_loop<R: Read>(mut reader: R, events: mpsc::UnboundedSender<LinkEvent>, stop: Arc<AtomicBool>) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 1024];

    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut buf) {
            Ok(0) => std::thread::sleep(Duration::from_millis(5)),
            Ok(n) => {
                for line in framer.push(&buf[..n]) {
                    if events.send(LinkEvent::Line(line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                tracing::error!("Serial read failed: {}", e);
                let _ = events.send(LinkEvent::Closed(Some(e.to_string())));
                return;
            }
        }
    }
}

fn write_loop<W: Write>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    stop: Arc<AtomicBool>,
) {
    while let Some(data) = outbound.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::error!("Serial write failed: {}", e);
            let _ = events.send(LinkEvent::Closed(Some(e.to_string())));
            break;
        }
    }
    stop.store(true, Ordering::Release);
}
