//! Protocol implementations.

pub mod packet;

// Re-export common types
pub use packet::{Command, Packet, Value, checksum, decode, encode};
