//! Serial port handling
//!
//! Opening and enumeration of the ports a rig controller can sit on.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::path::Path;
use std::time::Duration;

use super::ProtocolError;

/// An available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor/product ID (if USB device)
    pub usb_id: Option<(u16, u16)>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                usb_id: Some((usb.vid, usb.pid)),
                product: usb.product,
            },
            _ => Self {
                name: info.port_name,
                usb_id: None,
                product: None,
            },
        }
    }
}

/// Sort key placing ttyACM* (native USB boards) before ttyUSB* (FTDI
/// adapters), each numerically, then everything else by name
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

/// List available serial ports in a deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut ports: Vec<PortInfo> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
        .collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open a rig controller port (8N1, no flow control)
///
/// On Unix the device node must exist; a missing node means the configured
/// path is wrong rather than the board being busy.
pub fn open_port(
    name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, ProtocolError> {
    if cfg!(unix) && !Path::new(name).exists() {
        return Err(ProtocolError::ConnectionUnavailable {
            port: name.to_string(),
            reason: "serial port incorrect, check the rig config".to_string(),
        });
    }

    let unavailable = |e: serialport::Error| ProtocolError::ConnectionUnavailable {
        port: name.to_string(),
        reason: e.to_string(),
    };

    let mut port = serialport::new(name, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(unavailable)?;
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(unavailable)?;
    port.set_parity(serialport::Parity::None)
        .map_err(unavailable)?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(unavailable)?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(unavailable)?;

    tracing::debug!("opened {} at {} baud", name, baud_rate);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_sorting() {
        let mut names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        names.sort_by_key(|n| port_sort_key(n));

        assert_eq!(
            names,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_device_node() {
        let result = open_port("/dev/does-not-exist-rig", 115200, Duration::from_millis(10));
        assert!(matches!(
            result,
            Err(ProtocolError::ConnectionUnavailable { .. })
        ));
    }
}
