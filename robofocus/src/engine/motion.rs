//! Byte-level completion tracking for a running move.
//!
//! While the motor turns the device streams one `I` or `O` per step and
//! finishes with `F` followed by the 8 remaining bytes of an `FD` packet that
//! carries the final position. The same loop serves the explicit completion
//! waiter and the external-move watcher, for both engines.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::packet::{self, MESSAGE_LEN, PACKET_LEN, PACKET_START, STEP_IN, STEP_OUT};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Source of status bytes while the motor runs.
pub trait ByteSource {
    /// Next byte, or `None` once the per-byte timeout passes with no data.
    fn next_byte(&mut self) -> Result<Option<u8>>;

    /// Fill `buf` as far as possible; returns how many bytes were read.
    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drop anything still buffered after completion.
    fn discard_input(&mut self) -> Result<()>;
}

impl<P: Port + ?Sized> ByteSource for P {
    fn next_byte(&mut self) -> Result<Option<u8>> {
        self.read_byte()
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_up_to(buf)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.clear_input()
    }
}

/// Bounds for one tracking run.
#[derive(Debug, Clone, Copy)]
pub struct MotionLimits {
    /// Give up with [`WaitOutcome::Stalled`] after this much silence.
    pub stall_timeout: Option<Duration>,
    /// Give up with [`WaitOutcome::DeadlineExpired`] after this long overall.
    pub deadline: Duration,
}

/// How a tracking run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A completion packet arrived; the position is final.
    Completed(u32),
    /// No status byte within the stall timeout; the position is the last
    /// one counted.
    Stalled(u32),
    /// The cancel check fired.
    Cancelled,
    /// The overall deadline passed.
    DeadlineExpired,
}

/// Consume status bytes until the move completes.
///
/// `position` is updated on every step byte and set to the reported value
/// when a valid `FD` packet ends the move. `cancelled` is polled once per
/// byte read, so cancellation takes effect within one per-byte timeout.
pub fn track<S, F>(
    source: &mut S,
    position: &AtomicU32,
    limits: &MotionLimits,
    cancelled: F,
) -> Result<WaitOutcome>
where
    S: ByteSource + ?Sized,
    F: Fn() -> bool,
{
    let start = Instant::now();
    let mut last_byte = Instant::now();
    let mut direction_logged = false;

    loop {
        if cancelled() {
            debug!("Motion tracking cancelled");
            return Ok(WaitOutcome::Cancelled);
        }
        if start.elapsed() > limits.deadline {
            return Ok(WaitOutcome::DeadlineExpired);
        }
        if let Some(stall) = limits.stall_timeout {
            if last_byte.elapsed() > stall {
                warn!(
                    "Movement stall detected (no status bytes for {}s)",
                    stall.as_secs_f32()
                );
                source.discard_input()?;
                return Ok(WaitOutcome::Stalled(position.load(Ordering::SeqCst)));
            }
        }

        let Some(byte) = source.next_byte()? else {
            continue;
        };
        last_byte = Instant::now();

        match byte {
            STEP_IN => {
                // fetch_update only fails when the closure returns None.
                let _ = position.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                    Some(p.saturating_sub(1))
                });
                if !direction_logged {
                    info!("Moving inward...");
                    direction_logged = true;
                }
            },
            STEP_OUT => {
                position.fetch_add(1, Ordering::SeqCst);
                if !direction_logged {
                    info!("Moving outward...");
                    direction_logged = true;
                }
            },
            PACKET_START => {
                let mut raw = [0u8; PACKET_LEN];
                raw[0] = PACKET_START;
                let n = source.read_into(&mut raw[1..])?;
                if n < MESSAGE_LEN {
                    warn!("Incomplete response after 'F': {}/{PACKET_LEN} bytes", n + 1);
                    continue;
                }
                trace!("RX: {}", packet::hex(&raw));

                match packet::decode(&raw) {
                    Ok(reply) if reply.is_position_report() => {
                        let final_position = reply.value.as_u32();
                        position.store(final_position, Ordering::SeqCst);
                        info!("Movement finished at position {final_position}");
                    },
                    Ok(reply) => {
                        warn!("Unexpected {} response during movement", reply.command);
                    },
                    Err(e) => warn!("Undecodable completion packet: {e}"),
                }

                source.discard_input()?;
                return Ok(WaitOutcome::Completed(position.load(Ordering::SeqCst)));
            },
            other => debug!("Unexpected byte during movement: 0x{other:02X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use crate::protocol::packet::{Command, encode};
    use std::cell::Cell;

    fn limits() -> MotionLimits {
        MotionLimits {
            stall_timeout: Some(Duration::from_millis(200)),
            deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_steps_then_completion_packet() {
        let mut port = MockPort::new();
        port.feed(b"OOOO");
        port.feed(&encode(Command::POSITION, 1004).unwrap());

        let position = AtomicU32::new(1000);
        let outcome = track(&mut port, &position, &limits(), || false).unwrap();
        assert_eq!(outcome, WaitOutcome::Completed(1004));
        assert_eq!(position.load(Ordering::SeqCst), 1004);
    }

    #[test]
    fn test_completion_packet_value_is_authoritative() {
        let mut port = MockPort::new();
        port.feed(b"III");
        port.feed(&encode(Command::POSITION, 500).unwrap());

        let position = AtomicU32::new(1000);
        let outcome = track(&mut port, &position, &limits(), || false).unwrap();
        assert_eq!(outcome, WaitOutcome::Completed(500));
    }

    #[test]
    fn test_inward_steps_saturate_at_zero() {
        let mut port = MockPort::new();
        port.feed(b"III");

        let position = AtomicU32::new(1);
        let outcome = track(&mut port, &position, &limits(), || false).unwrap();
        assert_eq!(outcome, WaitOutcome::Stalled(0));
    }

    #[test]
    fn test_bad_checksum_completes_with_counted_position() {
        let mut port = MockPort::new();
        port.feed(b"OO");
        let mut fd = encode(Command::POSITION, 9999).unwrap();
        fd[8] ^= 0xFF;
        port.feed(&fd);

        let position = AtomicU32::new(10);
        let outcome = track(&mut port, &position, &limits(), || false).unwrap();
        assert_eq!(outcome, WaitOutcome::Completed(12));
    }

    #[test]
    fn test_garbage_bytes_are_skipped() {
        let mut port = MockPort::new();
        port.feed(&[0x00, 0x7F, b'O']);
        port.feed(&encode(Command::POSITION, 11).unwrap());

        let position = AtomicU32::new(10);
        let outcome = track(&mut port, &position, &limits(), || false).unwrap();
        assert_eq!(outcome, WaitOutcome::Completed(11));
    }

    #[test]
    fn test_stall_without_stall_guard_runs_to_deadline() {
        let mut port = MockPort::new();
        let position = AtomicU32::new(7);
        let limits = MotionLimits {
            stall_timeout: None,
            deadline: Duration::from_millis(100),
        };
        let outcome = track(&mut port, &position, &limits, || false).unwrap();
        assert_eq!(outcome, WaitOutcome::DeadlineExpired);
    }

    #[test]
    fn test_cancel_is_observed() {
        let mut port = MockPort::new();
        port.feed(b"OOOOO");
        let position = AtomicU32::new(0);
        let reads = Cell::new(0);
        let outcome = track(&mut port, &position, &limits(), || {
            reads.set(reads.get() + 1);
            reads.get() > 2
        })
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert_eq!(position.load(Ordering::SeqCst), 2);
    }
}
