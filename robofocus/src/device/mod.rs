//! Port enumeration and RoboFocus discovery.
//!
//! Discovery is independent of any live engine: each candidate port is opened
//! briefly, sent an `FV` handshake and closed again. A port answers as a
//! RoboFocus only if it returns a full 9-byte `FV` packet with a valid checksum.

use crate::error::{Error, Result};
use crate::port::{Port, PortInfo};
use crate::protocol::packet::{self, Command, PACKET_LEN};

#[cfg(feature = "native")]
use {
    crate::port::{NativePort, NativePortEnumerator, PortEnumerator, SerialConfig},
    log::{debug, info, trace, warn},
    std::time::{Duration, Instant},
};

/// Default per-port timeout while scanning.
#[cfg(feature = "native")]
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(1);

/// A port that answered the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Port name/path.
    pub port: String,
    /// Firmware version reported by `FV`.
    pub firmware_version: String,
    /// Port description from the operating system.
    pub description: String,
}

/// Send `FV` on an open port and return the firmware version it reports.
pub fn identify<P: Port + ?Sized>(port: &mut P) -> Result<String> {
    port.clear_buffers()?;
    port.write_all_bytes(&packet::encode(Command::VERSION, 0)?)?;

    let mut response = [0u8; PACKET_LEN];
    let n = port.read_up_to(&mut response)?;
    if n != PACKET_LEN {
        return Err(Error::Timeout(format!(
            "{}: expected {PACKET_LEN} bytes, got {n}",
            port.name()
        )));
    }

    let reply = packet::decode(&response)?.validated()?;
    if reply.command != Command::VERSION {
        return Err(Error::Handshake(format!(
            "unexpected {} reply to FV",
            reply.command
        )));
    }
    Ok(reply.value.to_version_string())
}

/// Drop Bluetooth ports unless requested and sort by name.
pub fn filter_ports(mut ports: Vec<PortInfo>, include_bluetooth: bool) -> Vec<PortInfo> {
    ports.retain(|p| include_bluetooth || !p.is_bluetooth);
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

/// Probe each candidate with `probe`, skipping listed and Bluetooth ports.
pub fn scan_ports<F>(
    ports: &[PortInfo],
    skip_ports: &[String],
    include_bluetooth: bool,
    mut probe: F,
) -> Vec<DiscoveredDevice>
where
    F: FnMut(&PortInfo) -> Option<DiscoveredDevice>,
{
    ports
        .iter()
        .filter(|p| !skip_ports.contains(&p.name))
        .filter(|p| include_bluetooth || !p.is_bluetooth)
        .filter_map(&mut probe)
        .collect()
}

/// List serial ports on this machine, sorted by name.
#[cfg(feature = "native")]
pub fn list_available_ports(include_bluetooth: bool) -> Result<Vec<PortInfo>> {
    let ports = filter_ports(NativePortEnumerator::list_ports()?, include_bluetooth);
    debug!("Found {} serial ports", ports.len());
    Ok(ports)
}

/// Open `port_name`, run the handshake and close it again.
///
/// Returns `None` for anything that is not a responding RoboFocus.
#[cfg(feature = "native")]
pub fn probe_port(port_name: &str, description: &str, timeout: Duration) -> Option<DiscoveredDevice> {
    debug!("Probing {port_name} ({description})...");

    let config = SerialConfig::new(port_name).with_timeout(timeout);
    let mut port = match NativePort::open(&config) {
        Ok(port) => port,
        Err(Error::PortInUse(_)) => {
            debug!("Skipping {port_name}: port in use");
            return None;
        },
        Err(e) => {
            debug!("Skipping {port_name}: {e}");
            return None;
        },
    };

    let result = identify(&mut port);
    let _ = port.close();

    match result {
        Ok(firmware_version) => {
            info!("Found RoboFocus on {port_name} (firmware: {firmware_version})");
            Some(DiscoveredDevice {
                port: port_name.to_string(),
                firmware_version,
                description: description.to_string(),
            })
        },
        Err(e) => {
            trace!("{port_name}: {e}");
            None
        },
    }
}

/// Scan every available port for RoboFocus devices.
#[cfg(feature = "native")]
pub fn scan_for_devices(
    timeout: Duration,
    skip_ports: &[String],
    include_bluetooth: bool,
) -> Result<Vec<DiscoveredDevice>> {
    let ports = list_available_ports(include_bluetooth)?;
    info!("Scanning {} ports for RoboFocus devices...", ports.len());

    let start = Instant::now();
    let found = scan_ports(&ports, skip_ports, include_bluetooth, |p| {
        probe_port(&p.name, &p.description, timeout)
    });

    info!(
        "Scan complete: found {} RoboFocus device(s) in {}ms",
        found.len(),
        start.elapsed().as_millis()
    );
    if found.is_empty() {
        warn!("No RoboFocus device found on any serial port");
    }
    Ok(found)
}

/// Return the first RoboFocus found, if any.
#[cfg(feature = "native")]
pub fn find_first_device(
    timeout: Duration,
    skip_ports: &[String],
) -> Result<Option<DiscoveredDevice>> {
    let mut found = scan_for_devices(timeout, skip_ports, false)?;
    if found.len() > 1 {
        warn!(
            "Multiple RoboFocus devices found, using first one: {}",
            found[0].port
        );
    }
    Ok(if found.is_empty() {
        None
    } else {
        Some(found.swap_remove(0))
    })
}

/// Format ports for display.
pub fn format_port_list(ports: &[PortInfo]) -> Vec<String> {
    ports
        .iter()
        .map(|p| {
            let mut line = p.name.clone();
            if !p.description.is_empty() {
                line.push_str(&format!(" - {}", p.description));
            }
            if p.is_bluetooth {
                line.push_str(" [Bluetooth]");
            }
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockPort, Reply};

    fn port(name: &str, bluetooth: bool) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            description: if bluetooth {
                "Standard Serial over Bluetooth link".to_string()
            } else {
                "USB-SERIAL CH340".to_string()
            },
            hardware_id: String::new(),
            is_bluetooth: bluetooth,
        }
    }

    #[test]
    fn test_identify_integer_firmware() {
        let mut mock = MockPort::new();
        mock.reply(Reply::Bytes(packet::encode(Command::VERSION, 2100).unwrap().to_vec()));
        assert_eq!(identify(&mut mock).unwrap(), "002100");
        assert_eq!(mock.written_packets(), vec!["FV000000"]);
    }

    #[test]
    fn test_identify_decimal_firmware() {
        let mut reply = b"FV003.20".to_vec();
        reply.push(packet::checksum(b"FV003.20"));
        let mut mock = MockPort::new();
        mock.reply(Reply::Bytes(reply));
        assert_eq!(identify(&mut mock).unwrap(), "3.2");
    }

    #[test]
    fn test_identify_rejects_silence_and_bad_checksum() {
        let mut mock = MockPort::new();
        mock.reply(Reply::Silence);
        assert!(matches!(identify(&mut mock), Err(Error::Timeout(_))));

        let mut bad = packet::encode(Command::VERSION, 2100).unwrap();
        bad[8] ^= 0x01;
        let mut mock = MockPort::new();
        mock.reply(Reply::Bytes(bad.to_vec()));
        assert!(matches!(identify(&mut mock), Err(Error::ChecksumMismatch(_))));
    }

    #[test]
    fn test_identify_rejects_other_command() {
        let mut mock = MockPort::new();
        mock.reply(Reply::Bytes(packet::encode(Command::POSITION, 2100).unwrap().to_vec()));
        assert!(matches!(identify(&mut mock), Err(Error::Handshake(_))));
    }

    #[test]
    fn test_filter_ports_sorts_and_drops_bluetooth() {
        let ports = vec![port("COM7", false), port("COM3", true), port("COM1", false)];

        let names: Vec<_> = filter_ports(ports.clone(), false)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["COM1", "COM7"]);

        let names: Vec<_> = filter_ports(ports, true).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["COM1", "COM3", "COM7"]);
    }

    #[test]
    fn test_scan_ports_honors_skip_list() {
        let ports = vec![port("COM1", false), port("COM2", false), port("COM3", true)];
        let mut probed = Vec::new();

        let found = scan_ports(&ports, &["COM1".to_string()], false, |p| {
            probed.push(p.name.clone());
            Some(DiscoveredDevice {
                port: p.name.clone(),
                firmware_version: "002100".to_string(),
                description: p.description.clone(),
            })
        });

        assert_eq!(probed, vec!["COM2"]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, "COM2");
    }

    #[test]
    fn test_format_port_list() {
        let formatted = format_port_list(&[port("/dev/ttyUSB0", false), port("/dev/rfcomm0", true)]);
        assert_eq!(formatted[0], "/dev/ttyUSB0 - USB-SERIAL CH340");
        assert!(formatted[1].ends_with("[Bluetooth]"));
    }
}
