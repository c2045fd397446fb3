/// Serial link to the servo board
///
/// Finds the board by its USB description (or takes an explicit device path),
/// opens it, waits out the reset that every new connection triggers and
/// splits the port into a reader half for telemetry and a writer half for
/// servo frames.

use std::thread;

use anyhow::{anyhow, Result};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};

use crate::config_loader::LinkSettings;
use crate::error::ControlError;

/// Human-readable description of a port: USB product and manufacturer when
/// known, else the kind of port.
pub fn port_description(info: &SerialPortInfo) -> String {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("");
            let manufacturer = usb.manufacturer.as_deref().unwrap_or("");
            format!("{} {} ({:04x}:{:04x})", product, manufacturer, usb.vid, usb.pid)
                .trim()
                .to_string()
        }
        SerialPortType::PciPort => "PCI device".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "n/a".to_string(),
    }
}

pub fn matches_descriptor(port_name: &str, description: &str, descriptor: &str) -> bool {
    let needle = descriptor.to_ascii_lowercase();
    !needle.is_empty()
        && (description.to_ascii_lowercase().contains(&needle) || port_name.to_ascii_lowercase().contains(&needle))
}

/// First port whose description or name contains `descriptor`.
pub fn select_port(ports: &[SerialPortInfo], descriptor: &str) -> Result<String, ControlError> {
    if ports.is_empty() {
        return Err(ControlError::NoSerialPorts);
    }
    ports
        .iter()
        .find(|p| matches_descriptor(&p.port_name, &port_description(p), descriptor))
        .map(|p| p.port_name.clone())
        .ok_or_else(|| ControlError::NoArduinoPort {
            descriptor: descriptor.to_string(),
            found: ports
                .iter()
                .map(|p| format!("{} [{}]", p.port_name, port_description(p)))
                .collect::<Vec<_>>()
                .join(", "),
        })
}

pub fn find_arduino_port(descriptor: &str) -> Result<String> {
    let ports = serialport::available_ports().map_err(|e| anyhow!("Failed to enumerate serial ports: {}", e))?;
    for p in &ports {
        log::debug!(target: "arduino_connection", "Found {} [{}]", p.port_name, port_description(p));
    }
    Ok(select_port(&ports, descriptor)?)
}

/// An open, reset-settled link. Both halves share the OS handle.
pub struct ArduinoConnection {
    port_name: String,
    reader: Box<dyn SerialPort>,
    writer: Box<dyn SerialPort>,
}

impl ArduinoConnection {
    pub fn open(settings: &LinkSettings) -> Result<Self> {
        let port_name = match settings.port.as_deref() {
            Some(p) => p.to_string(),
            None => find_arduino_port(&settings.descriptor)?,
        };
        log::info!(target: "arduino_connection", "Opening {} at {} baud", port_name, settings.baud);
        let writer = serialport::new(port_name.as_str(), settings.baud)
            .timeout(settings.read_timeout())
            .open()
            .map_err(|e| anyhow!("Connection to {} failed: {}", port_name, e))?;
        // Arduino reset delay
        thread::sleep(settings.reset_delay());
        let reader = writer
            .try_clone()
            .map_err(|e| anyhow!("Failed to clone handle for {}: {}", port_name, e))?;
        log::info!(target: "arduino_connection", "Connected to {}", port_name);
        Ok(Self { port_name, reader, writer })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// `(reader, writer)`
    pub fn into_split(self) -> (Box<dyn SerialPort>, Box<dyn SerialPort>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, kind: SerialPortType) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: kind,
        }
    }

    #[test]
    fn descriptor_match_is_case_insensitive() {
        assert!(matches_descriptor("/dev/ttyACM0", "Arduino Uno Arduino (2341:0043)", "Arduino Uno"));
        assert!(matches_descriptor("/dev/ttyACM0", "arduino uno", "ARDUINO UNO"));
        assert!(matches_descriptor("/dev/ttyACM0", "n/a", "ttyACM"));
        assert!(!matches_descriptor("/dev/ttyS0", "PCI device", "Arduino Uno"));
        assert!(!matches_descriptor("/dev/ttyS0", "PCI device", ""));
    }

    #[test]
    fn no_ports_is_an_error() {
        assert!(matches!(select_port(&[], "Arduino Uno"), Err(ControlError::NoSerialPorts)));
    }

    #[test]
    fn unmatched_ports_are_listed() {
        let ports = [port("/dev/ttyS0", SerialPortType::PciPort), port("/dev/ttyS1", SerialPortType::Unknown)];
        match select_port(&ports, "Arduino Uno") {
            Err(ControlError::NoArduinoPort { descriptor, found }) => {
                assert_eq!(descriptor, "Arduino Uno");
                assert!(found.contains("/dev/ttyS0 [PCI device]"));
                assert!(found.contains("/dev/ttyS1 [n/a]"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn first_matching_name_wins() {
        let ports = [
            port("/dev/ttyS0", SerialPortType::PciPort),
            port("/dev/ttyACM0", SerialPortType::Unknown),
            port("/dev/ttyACM1", SerialPortType::Unknown),
        ];
        assert_eq!(select_port(&ports, "ttyACM").unwrap(), "/dev/ttyACM0");
    }
}
