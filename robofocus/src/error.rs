//! Error types for robofocus.

use std::io;
use thiserror::Error;

/// Result type for robofocus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for robofocus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial channel.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The focuser (or its serial port) is not connected.
    #[error("Focuser not connected")]
    NotConnected,

    /// A value is out of range or otherwise rejected.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The operation is not allowed in the current lifecycle state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// No response arrived within the configured timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A received packet failed checksum validation.
    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Malformed or incomplete packet.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A command kept failing after the whole retry budget was spent.
    #[error("{command} failed after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        /// Command code that was retried.
        command: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<Error>,
    },

    /// The command would be interpreted as a stop by moving hardware.
    #[error("Movement in progress: {0}")]
    MovementInProgress(String),

    /// The temperature sensor reported an implausible value.
    #[error("Sensor error: {0}")]
    Sensor(String),

    /// The device did not identify itself on connect.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The serial port does not exist.
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// The serial port is held by another process.
    #[error("Port in use: {0}")]
    PortInUse(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a single command attempt failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ChecksumMismatch(_))
    }

    /// Map a failure to open `port_name` onto the port error taxonomy.
    #[cfg(feature = "native")]
    pub(crate) fn from_open_failure(port_name: &str, err: serialport::Error) -> Self {
        let description = err.description.to_lowercase();
        match err.kind() {
            serialport::ErrorKind::NoDevice => Self::PortNotFound(port_name.to_string()),
            serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                Self::PortNotFound(port_name.to_string())
            },
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                Self::PortInUse(port_name.to_string())
            },
            _ if description.contains("busy")
                || description.contains("in use")
                || description.contains("access is denied") =>
            {
                Self::PortInUse(port_name.to_string())
            },
            _ if description.contains("no such file") || description.contains("not found") => {
                Self::PortNotFound(port_name.to_string())
            },
            _ => Self::Serial(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(Error::ChecksumMismatch("x".into()).is_retryable());
        assert!(!Error::Protocol("x".into()).is_retryable());
        assert!(!Error::MovementInProgress("x".into()).is_retryable());
    }

    #[test]
    fn test_max_retries_message_includes_last_error() {
        let err = Error::MaxRetriesExceeded {
            command: "FG".into(),
            attempts: 3,
            last: Box::new(Error::Timeout("no response to FG".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("FG failed after 3 attempts"));
        assert!(msg.contains("no response to FG"));
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_open_failure_mapping() {
        let missing = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            Error::from_open_failure("COM9", missing),
            Error::PortNotFound(_)
        ));

        let busy = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "denied",
        );
        assert!(matches!(Error::from_open_failure("COM9", busy), Error::PortInUse(_)));

        let busy_text = serialport::Error::new(serialport::ErrorKind::Unknown, "Device or resource busy");
        assert!(matches!(
            Error::from_open_failure("/dev/ttyUSB0", busy_text),
            Error::PortInUse(_)
        ));
    }
}
