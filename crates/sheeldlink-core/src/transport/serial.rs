//! Serial port links
//!
//! On hosts where the platform binds a paired board to a serial device
//! (`/dev/rfcomm*`, an outgoing Bluetooth COM port, or a USB serial adapter
//! during bench testing) the board is reachable as a plain byte stream.

use async_trait::async_trait;
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::Arc;

use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;

use super::{Link, LinkFactory, TransportKind};
use crate::device::BoardInfo;
use crate::manager::{DiscoveredDevice, DiscoveryEvent, Scanner};
use crate::protocol::ProtocolError;

/// Baud rate of the board's Bluetooth module
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const READ_BUFFER_SIZE: usize = 256;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/rfcomm0" or "COM7")
    pub name: String,

    /// Product name (if USB device)
    pub product: Option<String>,

    /// Manufacturer name (if USB device)
    pub manufacturer: Option<String>,

    /// Serial number (if USB device)
    pub serial_number: Option<String>,

    /// Whether the platform reports a Bluetooth-bound port
    pub bluetooth: bool,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let bluetooth = matches!(info.port_type, SerialPortType::BluetoothPort)
            || is_rfcomm(&info.port_name);
        let (product, manufacturer, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb) => (usb.product, usb.manufacturer, usb.serial_number),
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            product,
            manufacturer,
            serial_number,
            bluetooth,
        }
    }
}

fn is_rfcomm(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .is_some_and(|base| base.starts_with("rfcomm"))
}

/// Sort key putting Bluetooth ports first:
///  - rfcomm* (numerically by suffix)
///  - then ttyACM* and ttyUSB* (numerically)
///  - then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0, "rfcomm"), (1, "ttyACM"), (2, "ttyUSB")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    // rfcomm bindings are often missing from the enumeration
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("rfcomm") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        product: None,
                        manufacturer: None,
                        serial_number: None,
                        bluetooth: true,
                    });
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Byte-stream link over a serial port
pub struct SerialLink {
    path: String,
    baud_rate: u32,
    reader: Mutex<Option<ReadHalf<SerialStream>>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    closed: CancellationToken,
}

impl SerialLink {
    /// Create an unopened link to `path`
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Port path
    pub fn path(&self) -> &str {
        &self.path
    }

    fn open_stream(&self) -> Result<SerialStream, ProtocolError> {
        let mut stream = tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ProtocolError::Transport(format!("{}: {}", self.path, e)))?;

        // Keep DTR asserted so USB adapters do not reset the board on open
        if let Err(e) = stream.write_data_terminal_ready(true) {
            tracing::debug!("{}: could not set DTR ({}), continuing", self.path, e);
        }
        Ok(stream)
    }
}

#[async_trait]
impl Link for SerialLink {
    async fn connect(&self) -> Result<(), ProtocolError> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::Closed);
        }
        let stream = self.open_stream()?;
        let (reader, writer) = tokio::io::split(stream);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        tracing::debug!("opened {} at {} baud", self.path, self.baud_rate);
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::Closed),
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Err(ProtocolError::Closed);
                }
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        tracing::debug!("closed {}", self.path);
    }
}

/// Opens [`SerialLink`]s, treating the board address as the port path
#[derive(Debug, Clone)]
pub struct SerialLinkFactory {
    baud_rate: u32,
}

impl SerialLinkFactory {
    /// Factory opening ports at `baud_rate`
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialLinkFactory {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl LinkFactory for SerialLinkFactory {
    fn name(&self) -> &str {
        "serial"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn open(&self, board: &BoardInfo) -> Result<Arc<dyn Link>, ProtocolError> {
        Ok(Arc::new(SerialLink::new(board.address(), self.baud_rate)))
    }
}

/// Reports serial ports as discovered devices.
///
/// Bluetooth-bound ports carry no name, so the manager treats them as boards;
/// USB ports are reported under their product name.
#[derive(Debug, Clone, Default)]
pub struct SerialScanner;

impl SerialScanner {
    /// Create a scanner
    pub fn new() -> Self {
        Self
    }
}

fn discovered(port: PortInfo) -> DiscoveredDevice {
    DiscoveredDevice {
        name: if port.bluetooth { None } else { port.product },
        address: port.name,
        paired: port.bluetooth,
        kind: Some(TransportKind::Stream),
    }
}

#[async_trait]
impl Scanner for SerialScanner {
    async fn start_discovery(
        &self,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<(), ProtocolError> {
        let ports = tokio::task::spawn_blocking(list_ports)
            .await
            .map_err(|e| ProtocolError::Transport(format!("port enumeration failed: {}", e)))?;
        tracing::debug!("found {} serial ports", ports.len());

        for port in ports {
            if events.send(DiscoveryEvent::DeviceFound(discovered(port))).is_err() {
                return Ok(());
            }
        }
        let _ = events.send(DiscoveryEvent::Finished);
        Ok(())
    }

    async fn stop_discovery(&self) {}
}
