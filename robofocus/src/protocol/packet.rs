//! RoboFocus 9-byte packet codec.
//!
//! Every request and response on the wire has the same shape:
//!
//! ```text
//! +---------+---------------------+----------+
//! | Command |        Value        | Checksum |
//! +---------+---------------------+----------+
//! | 2 ASCII | 6 ASCII dec. digits |  1 byte  |
//! +---------+---------------------+----------+
//! |  "FG"   |      "002500"       |   0xB4   |
//! +---------+---------------------+----------+
//! ```
//!
//! The checksum is the sum of the first eight byte values modulo 256.
//!
//! While the motor runs the device also emits unsolicited single bytes:
//! `I` (one step inward), `O` (one step outward) and `F`, which starts the
//! final position packet.

use crate::error::{Error, Result};
use std::fmt;

/// Total packet length on the wire.
pub const PACKET_LEN: usize = 9;

/// Length of the checksummed message (command + value).
pub const MESSAGE_LEN: usize = 8;

/// Largest value that fits in the 6-digit value field.
pub const MAX_VALUE: u32 = 999_999;

/// Asynchronous byte: one step inward.
pub const STEP_IN: u8 = b'I';

/// Asynchronous byte: one step outward.
pub const STEP_OUT: u8 = b'O';

/// First byte of every response packet.
pub const PACKET_START: u8 = b'F';

/// Two-letter command code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command([u8; 2]);

impl Command {
    /// `FV`: firmware version (handshake).
    pub const VERSION: Self = Self(*b"FV");
    /// `FG`: query position (value 0) or go to absolute position.
    pub const GOTO: Self = Self(*b"FG");
    /// `FD`: position report sent by the device.
    pub const POSITION: Self = Self(*b"FD");
    /// `FT`: raw temperature ADC reading.
    pub const TEMPERATURE: Self = Self(*b"FT");
    /// `FQ`: halt motion immediately.
    pub const HALT: Self = Self(*b"FQ");
    /// `FB`: backlash compensation (value 0 queries).
    pub const BACKLASH: Self = Self(*b"FB");
    /// `FL`: maximum travel (value 0 queries).
    pub const MAX_TRAVEL: Self = Self(*b"FL");
    /// `FS`: set the step counter without moving.
    pub const SYNC: Self = Self(*b"FS");

    /// Build a command from a 2-character ASCII code.
    pub fn new(code: &str) -> Result<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_graphic) {
            return Err(Error::InvalidValue(format!(
                "command must be exactly 2 ASCII characters, got {code:?}"
            )));
        }
        Ok(Self([bytes[0], bytes[1]]))
    }

    /// Raw command bytes.
    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }

    /// Command code as text.
    pub fn as_str(&self) -> &str {
        // Constructed only from ASCII.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self.as_str())
    }
}

/// Numeric content of the value field.
///
/// Most firmware reports plain integers. Some revisions answer `FV` with a
/// decimal version such as `003.20`, which is kept as a decimal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Six-digit integer.
    Integer(u32),
    /// Decimal text (firmware version on some revisions).
    Decimal(f64),
}

impl Value {
    /// Integer view of the value; decimals are truncated.
    pub fn as_u32(&self) -> u32 {
        match *self {
            Self::Integer(v) => v,
            Self::Decimal(v) => v.max(0.0) as u32,
        }
    }

    /// Format as a firmware version string.
    pub fn to_version_string(&self) -> String {
        match *self {
            Self::Integer(v) => format!("{v:06}"),
            Self::Decimal(v) => format!("{v}"),
        }
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Command code.
    pub command: Command,
    /// Value field.
    pub value: Value,
    /// Whether the received checksum matched the computed one.
    pub checksum_valid: bool,
}

impl Packet {
    /// Fail with [`Error::ChecksumMismatch`] unless the checksum matched.
    pub fn validated(self) -> Result<Self> {
        if self.checksum_valid {
            Ok(self)
        } else {
            Err(Error::ChecksumMismatch(format!(
                "bad checksum on {} packet",
                self.command
            )))
        }
    }

    /// Whether this is a valid `FD` position report.
    pub fn is_position_report(&self) -> bool {
        self.command == Command::POSITION && self.checksum_valid
    }
}

/// Sum of the message bytes modulo 256.
pub fn checksum(message: &[u8]) -> u8 {
    message
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Encode a command and value into a 9-byte packet.
pub fn encode(command: Command, value: u32) -> Result<[u8; PACKET_LEN]> {
    if value > MAX_VALUE {
        return Err(Error::InvalidValue(format!(
            "value must be 0-{MAX_VALUE}, got {value}"
        )));
    }

    encode_field(command, &format!("{value:06}"))
}

/// Encode a packet with a literal 6-character value field.
///
/// Used for replies such as a decimal firmware version (`003.20`) that do
/// not fit the integer form.
pub fn encode_field(command: Command, field: &str) -> Result<[u8; PACKET_LEN]> {
    let bytes = field.as_bytes();
    if bytes.len() != MESSAGE_LEN - 2 || !bytes.iter().all(u8::is_ascii_graphic) {
        return Err(Error::InvalidValue(format!(
            "value field must be 6 ASCII characters, got {field:?}"
        )));
    }

    let mut packet = [0u8; PACKET_LEN];
    packet[..2].copy_from_slice(command.as_bytes());
    packet[2..MESSAGE_LEN].copy_from_slice(bytes);
    packet[MESSAGE_LEN] = checksum(&packet[..MESSAGE_LEN]);
    Ok(packet)
}

/// Encode from a textual command code.
pub fn encode_str(code: &str, value: u32) -> Result<[u8; PACKET_LEN]> {
    encode(Command::new(code)?, value)
}

/// Decode a 9-byte packet.
///
/// The checksum is computed and reported, never assumed; use
/// [`Packet::validated`] to turn a mismatch into an error.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() != PACKET_LEN {
        return Err(Error::Protocol(format!(
            "expected {PACKET_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let message = &bytes[..MESSAGE_LEN];
    if !message.is_ascii() {
        return Err(Error::Protocol(format!(
            "non-ASCII packet: {}",
            hex(bytes)
        )));
    }

    let command = Command([message[0], message[1]]);
    let field = std::str::from_utf8(&message[2..]).map_err(|e| Error::Protocol(e.to_string()))?;
    let value = parse_value(field)?;
    let checksum_valid = checksum(message) == bytes[MESSAGE_LEN];

    Ok(Packet {
        command,
        value,
        checksum_valid,
    })
}

fn parse_value(field: &str) -> Result<Value> {
    if let Ok(v) = field.parse::<u32>() {
        return Ok(Value::Integer(v));
    }
    field
        .trim()
        .parse::<f64>()
        .map(Value::Decimal)
        .map_err(|_| Error::Protocol(format!("invalid value field {field:?}")))
}

/// Space-separated uppercase hex dump for trace logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
