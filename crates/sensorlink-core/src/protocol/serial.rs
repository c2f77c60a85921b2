//! Serial port handling
//!
//! Low-level serial port access and device discovery.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{Read, Write};
use std::time::Duration;

use crate::codec::{self, Message};

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// USB manufacturer strings that identify a sensorlink-compatible device.
const KNOWN_MANUFACTURERS: &[&str] = &["BioWear", "Sensorlink"];

/// USB product strings that identify a sensorlink-compatible device.
const KNOWN_PRODUCTS: &[&str] = &["SL-", "Pulseband"];

/// Read timeout used while probing a candidate port.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// Manufacturer name (if a USB device)
    pub manufacturer: Option<String>,

    /// Product name (if a USB device)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (manufacturer, product) = match info.port_type {
            SerialPortType::UsbPort(usb) => (usb.manufacturer, usb.product),
            _ => (None, None),
        };
        Self {
            name: info.port_name,
            manufacturer,
            product,
        }
    }
}

impl PortInfo {
    /// Whether the USB metadata looks like a compatible device.
    fn matches_device(&self) -> bool {
        let product_match = self
            .product
            .as_deref()
            .is_some_and(|p| KNOWN_PRODUCTS.iter().any(|hint| p.contains(hint)));
        let manufacturer_match = self
            .manufacturer
            .as_deref()
            .is_some_and(|m| KNOWN_MANUFACTURERS.iter().any(|hint| m.contains(hint)));
        product_match || manufacturer_match
    }
}

/// Sort key so that ttyACM* ports come first (numerically), then ttyUSB*,
/// then everything else by name.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        return (0, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        return (1, rest.parse().unwrap_or(usize::MAX), basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports with deterministic ordering.
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    // Linux-only: pick up /dev nodes the enumeration API missed
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert(PortInfo {
                        name: full,
                        manufacturer: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open a serial port. The short read timeout keeps the receive loop
/// responsive to shutdown.
pub fn open_port(
    name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = if baud_rate == 0 {
        DEFAULT_BAUD_RATE
    } else {
        baud_rate
    };
    serialport::new(name, baud)
        .timeout(read_timeout)
        .open()
        .map_err(|e| ProtocolError::Transport(e.to_string()))
}

/// Configure a serial port for device communication: 8N1, DTR asserted.
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;
    port.set_parity(serialport::Parity::None)
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;

    // Some adapters drop the link when DTR is left floating
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!(error = %e, "failed to assert DTR, continuing");
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::Transport(e.to_string()))
}

/// Find the first port with an answering device.
///
/// Candidates are ports whose USB metadata matches a known manufacturer or
/// product string; each candidate is probed with a heartbeat.
pub fn find_device_port() -> Result<String, ProtocolError> {
    let ports = list_ports();
    if ports.is_empty() {
        return Err(ProtocolError::PortNotFound(
            "no serial ports available".to_string(),
        ));
    }
    for port in ports.iter().filter(|p| p.matches_device()) {
        tracing::debug!(port = %port.name, "probing candidate port");
        if probe_port(&port.name) {
            return Ok(port.name.clone());
        }
    }
    Err(ProtocolError::PortNotFound(
        "no answering device found".to_string(),
    ))
}

/// Check whether an answering device sits behind `name` by sending a
/// heartbeat and expecting the exact heartbeat response frame back.
pub fn probe_port(name: &str) -> bool {
    let mut port = match open_port(name, DEFAULT_BAUD_RATE, PROBE_TIMEOUT) {
        Ok(port) => port,
        Err(e) => {
            tracing::debug!(port = name, error = %e, "probe open failed");
            return false;
        }
    };
    if port.write_all(&codec::encode(&Message::Heartbeat)).is_err() {
        return false;
    }
    let expected = codec::encode(&Message::HeartbeatResponse);
    let mut response = vec![0u8; expected.len()];
    match port.read_exact(&mut response) {
        Ok(()) => response == expected,
        Err(e) => {
            tracing::debug!(port = name, error = %e, "probe read failed");
            false
        }
    }
}
