//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig, is_bluetooth_description},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
}

impl NativePort {
    /// Open a serial port at 8-N-1 without flow control.
    ///
    /// Failures are mapped to [`Error::PortNotFound`] or [`Error::PortInUse`]
    /// where the operating system says enough to tell them apart.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!("Opening {} at {} baud", config.port_name, config.baud_rate);
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| Error::from_open_failure(&config.port_name, e))?;

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
        })
    }

    fn clear(&mut self, which: ClearBuffer) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(which)?;
        }
        Ok(())
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.timeout == timeout {
            return Ok(());
        }
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        trace!("Clearing buffers on {}", self.name);
        self.clear(ClearBuffer::All)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Input)
    }

    fn clear_output(&mut self) -> Result<()> {
        self.clear(ClearBuffer::Output)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        if self.port.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (description, hardware_id) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => {
                        let description = info
                            .product
                            .clone()
                            .or_else(|| info.manufacturer.clone())
                            .unwrap_or_else(|| "USB serial".to_string());
                        let mut hwid = format!("USB VID:PID={:04X}:{:04X}", info.vid, info.pid);
                        if let Some(serial) = &info.serial_number {
                            hwid.push_str(&format!(" SER={serial}"));
                        }
                        (description, hwid)
                    },
                    serialport::SerialPortType::BluetoothPort => {
                        ("Bluetooth serial".to_string(), "BTHENUM".to_string())
                    },
                    serialport::SerialPortType::PciPort => ("PCI serial".to_string(), String::new()),
                    serialport::SerialPortType::Unknown => (String::new(), String::new()),
                };

                let is_bluetooth = matches!(p.port_type, serialport::SerialPortType::BluetoothPort)
                    || is_bluetooth_description(&description)
                    || is_bluetooth_description(&hardware_id);

                PortInfo {
                    name: p.port_name,
                    description,
                    hardware_id,
                    is_bluetooth,
                }
            })
            .collect())
    }
}
