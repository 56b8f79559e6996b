//! Port abstraction for the focuser's RS-232 link.
//!
//! The engines talk to the wire only through the [`Port`] trait, so the same
//! byte-level state machine runs against a real `serialport` handle or an
//! in-memory script in tests.
//!
//! ```text
//! +------------------+
//! |  HardwareEngine  |   packet codec, state machine, retries
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    Port trait    |   byte reads with timeout, buffer flushes
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    NativePort    |   serialport crate, 9600 8-N-1
//! +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Baud rate fixed by the RoboFocus protocol.
pub const BAUD_RATE: u32 = 9600;

/// Default per-call response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Serial port configuration.
///
/// Data bits, parity and stop bits are fixed at 8-N-1 by the device.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a configuration for the given port at the protocol baud rate.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// Hardware identifier (USB VID:PID and serial when known).
    pub hardware_id: String,
    /// Whether this looks like a Bluetooth virtual port.
    pub is_bluetooth: bool,
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Discard both input and output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Discard pending input only.
    fn clear_input(&mut self) -> Result<()>;

    /// Discard pending output only.
    fn clear_output(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read one byte; `None` when the read timed out with no data.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Read up to `buf.len()` bytes, stopping early on timeout.
    ///
    /// Returns the number of bytes actually read.
    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_byte()? {
                Some(b) => {
                    buf[filled] = b;
                    filled += 1;
                },
                None => break,
            }
        }
        Ok(filled)
    }
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

/// Whether a port description names a Bluetooth virtual port.
pub fn is_bluetooth_description(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("bluetooth") || lower.contains("bth")
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory port for engine tests.

    use super::{Port, Result};
    use std::collections::VecDeque;
    use std::io::{ErrorKind, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// What the mock "device" does in reply to each written packet.
    #[derive(Debug, Clone)]
    pub enum Reply {
        /// Queue these bytes for reading.
        Bytes(Vec<u8>),
        /// Queue nothing (the read will time out).
        Silence,
    }

    #[derive(Debug, Default)]
    pub struct Shared {
        pub read_buf: VecDeque<u8>,
        pub written: Vec<u8>,
        pub replies: VecDeque<Reply>,
        pub clears: usize,
    }

    /// Cloneable handle so tests can inspect traffic after the engine owns the port.
    #[derive(Debug, Clone, Default)]
    pub struct MockPort {
        pub shared: Arc<Mutex<Shared>>,
        timeout: Duration,
    }

    impl MockPort {
        pub fn new() -> Self {
            Self {
                shared: Arc::default(),
                timeout: Duration::from_millis(10),
            }
        }

        /// Queue a reply for the next write.
        pub fn reply(&self, reply: Reply) -> &Self {
            self.shared.lock().unwrap().replies.push_back(reply);
            self
        }

        /// Push bytes straight into the read buffer.
        pub fn feed(&self, bytes: &[u8]) {
            self.shared.lock().unwrap().read_buf.extend(bytes.iter().copied());
        }

        pub fn written(&self) -> Vec<u8> {
            self.shared.lock().unwrap().written.clone()
        }

        /// Written data split into 9-byte packets.
        pub fn written_packets(&self) -> Vec<String> {
            self.written()
                .chunks(9)
                .map(|c| String::from_utf8_lossy(&c[..c.len().min(8)]).into_owned())
                .collect()
        }
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let popped = {
                let mut shared = self.shared.lock().unwrap();
                let n = buf.len().min(shared.read_buf.len());
                for b in buf.iter_mut().take(n) {
                    *b = shared.read_buf.pop_front().unwrap();
                }
                n
            };
            if popped == 0 {
                std::thread::sleep(self.timeout);
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            Ok(popped)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut shared = self.shared.lock().unwrap();
            shared.written.extend_from_slice(buf);
            if buf.len() == 9 {
                if let Some(Reply::Bytes(bytes)) = shared.replies.pop_front() {
                    shared.read_buf.extend(bytes);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            // Keep test timeouts short regardless of what the engine asks for.
            self.timeout = timeout.min(Duration::from_millis(20));
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn clear_buffers(&mut self) -> Result<()> {
            self.clear_input()
        }

        fn clear_input(&mut self) -> Result<()> {
            let mut shared = self.shared.lock().unwrap();
            shared.read_buf.clear();
            shared.clears += 1;
            Ok(())
        }

        fn clear_output(&mut self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
