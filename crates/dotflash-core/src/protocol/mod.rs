//! Bootloader protocol state machine
//!
//! ```text
//! Disconnected -> Handshaking -> Ready -> Writing(0..n) -> Verifying -> Done
//!                      |                      |                |
//!                      +----------------------+----------------+--> Aborted
//! ```
//!
//! Blocks are strictly sequential: `write_block` only accepts the block the
//! device expects next, and an acknowledgment for any other index is a
//! communication error.

pub mod framing;

use core::fmt;
use std::time::{Duration, Instant};

use crate::config::ProtocolTimeouts;
use crate::error::{Error, Result};
use crate::image::{FirmwareImage, TransferBlock};
use crate::session::DeviceSession;
use crate::transport::Transport;

pub use framing::{Framing, LineFraming, Reply, Request};

/// Bootloader protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderState {
    /// No bootloader exchange has happened yet
    Disconnected,
    /// Enter request sent, waiting for the ready line
    Handshaking,
    /// Bootloader accepts blocks
    Ready,
    /// Blocks acknowledged so far; the value is the next expected index
    Writing(u32),
    /// Device checksum requested
    Verifying,
    /// Image written and verified
    Done,
    /// Protocol ended without success
    Aborted,
}

impl fmt::Display for BootloaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Ready => write!(f, "ready"),
            Self::Writing(next) => write!(f, "writing (next block {})", next),
            Self::Verifying => write!(f, "verifying"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One bootloader conversation
pub struct Bootloader<F: Framing> {
    framing: F,
    timeouts: ProtocolTimeouts,
    state: BootloaderState,
    bytes_acked: u32,
}

impl<F: Framing> Bootloader<F> {
    /// Start a conversation in the `Disconnected` state
    pub fn new(framing: F, timeouts: ProtocolTimeouts) -> Self {
        Self {
            framing,
            timeouts,
            state: BootloaderState::Disconnected,
            bytes_acked: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> BootloaderState {
        self.state
    }

    /// Bytes acknowledged by the device so far
    pub fn bytes_acked(&self) -> u32 {
        self.bytes_acked
    }

    fn set_state(&mut self, state: BootloaderState) {
        log::debug!("bootloader: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Request bootloader mode and wait for the ready acknowledgment
    ///
    /// Lines other than the acknowledgment (boot banners) are skipped until
    /// the handshake timeout expires.
    pub fn enter_bootloader<T: Transport>(&mut self, session: &mut DeviceSession<T>) -> Result<()> {
        if self.state != BootloaderState::Disconnected {
            return Err(Error::Communication(format!(
                "cannot enter bootloader from state {}",
                self.state
            )));
        }

        self.set_state(BootloaderState::Handshaking);
        let result = self.handshake(session);
        match &result {
            Ok(()) => {
                log::info!("Bootloader ready");
                self.set_state(BootloaderState::Ready);
            }
            Err(e) => {
                log::debug!("bootloader: handshake failed: {}", e);
                self.set_state(BootloaderState::Aborted);
            }
        }
        result
    }

    fn handshake<T: Transport>(&mut self, session: &mut DeviceSession<T>) -> Result<()> {
        let timeout = self.timeouts.handshake;
        let deadline = Instant::now() + timeout;
        session.write_bytes(&self.framing.enter_request())?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::HandshakeTimeout(timeout.as_millis() as u64));
            }

            let line = match session.read_line(remaining) {
                Ok(line) => line,
                Err(Error::Timeout(_)) => {
                    return Err(Error::HandshakeTimeout(timeout.as_millis() as u64))
                }
                Err(e) => return Err(e),
            };

            if self.framing.is_ready(&line) {
                return Ok(());
            }
            if let Reply::Error(msg) = self.framing.parse_reply(&line) {
                return Err(Error::Communication(format!("bootloader error: {}", msg)));
            }
            log::debug!(
                "bootloader: ignoring line during handshake: {:?}",
                String::from_utf8_lossy(&line)
            );
        }
    }

    /// Send one block and wait for its acknowledgment
    ///
    /// On `BlockRejected`, `Communication` or `Timeout` the state is kept so
    /// the same block can be sent again.
    pub fn write_block<T: Transport>(
        &mut self,
        session: &mut DeviceSession<T>,
        block: &TransferBlock<'_>,
    ) -> Result<()> {
        let expected = match self.state {
            BootloaderState::Ready => 0,
            BootloaderState::Writing(next) => next,
            other => {
                return Err(Error::Communication(format!(
                    "cannot write block {} in state {}",
                    block.index, other
                )))
            }
        };
        if block.index != expected {
            return Err(Error::Communication(format!(
                "out-of-order block {} (expected {})",
                block.index, expected
            )));
        }
        if block.offset != self.bytes_acked {
            return Err(Error::Communication(format!(
                "block {} at offset 0x{:X} does not follow acknowledged data (0x{:X})",
                block.index, block.offset, self.bytes_acked
            )));
        }

        log::trace!(
            "bootloader: block {} offset 0x{:08X} len {}",
            block.index,
            block.offset,
            block.len()
        );
        session.write_bytes(&self.framing.block_request(block))?;

        let line = self.read_reply_line(session, self.timeouts.ack)?;
        match self.framing.parse_reply(&line) {
            Reply::Ack(index) if index == block.index => {
                self.bytes_acked = block.end();
                self.set_state(BootloaderState::Writing(block.index + 1));
                Ok(())
            }
            Reply::Ack(index) => Err(Error::Communication(format!(
                "acknowledgment for block {} while waiting for block {}",
                index, block.index
            ))),
            Reply::Nak(reason) => Err(Error::BlockRejected {
                index: block.index,
                reason,
            }),
            Reply::Error(msg) => Err(Error::Communication(format!("bootloader error: {}", msg))),
            Reply::Checksum(_) | Reply::Unrecognized => Err(Error::Communication(format!(
                "unexpected reply to block {}: {:?}",
                block.index,
                String::from_utf8_lossy(&line)
            ))),
        }
    }

    /// Ask the device for the checksum of the written range and compare
    pub fn verify<T: Transport>(
        &mut self,
        session: &mut DeviceSession<T>,
        image: &FirmwareImage,
    ) -> Result<()> {
        if !matches!(self.state, BootloaderState::Writing(_)) || self.bytes_acked != image.size() {
            return Err(Error::Communication(format!(
                "cannot verify in state {} with {} of {} bytes acknowledged",
                self.state,
                self.bytes_acked,
                image.size()
            )));
        }

        self.set_state(BootloaderState::Verifying);
        session.write_bytes(&self.framing.checksum_request(0, image.size()))?;

        let actual = match self.read_checksum(session) {
            Ok(crc) => crc,
            Err(e) => {
                self.set_state(BootloaderState::Aborted);
                return Err(e);
            }
        };

        if actual == image.checksum() {
            log::info!("Verified: device CRC32 0x{:08X} matches image", actual);
            self.set_state(BootloaderState::Done);
            Ok(())
        } else {
            self.set_state(BootloaderState::Aborted);
            Err(Error::VerificationMismatch {
                expected: image.checksum(),
                actual,
            })
        }
    }

    fn read_checksum<T: Transport>(&mut self, session: &mut DeviceSession<T>) -> Result<u32> {
        let line = self.read_reply_line(session, self.timeouts.verify)?;
        match self.framing.parse_reply(&line) {
            Reply::Checksum(crc) => Ok(crc),
            Reply::Error(msg) => Err(Error::Communication(format!("bootloader error: {}", msg))),
            _ => Err(Error::Communication(format!(
                "unexpected reply to checksum request: {:?}",
                String::from_utf8_lossy(&line)
            ))),
        }
    }

    /// Read the next non-empty line
    fn read_reply_line<T: Transport>(
        &mut self,
        session: &mut DeviceSession<T>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout.as_millis() as u64));
            }
            let line = session.read_line(remaining)?;
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Ok(line);
            }
        }
    }

    /// Leave the bootloader, best effort
    ///
    /// Failures are logged and never returned. Does nothing if the
    /// bootloader was never contacted.
    pub fn abort<T: Transport>(&mut self, session: &mut DeviceSession<T>) {
        if self.state == BootloaderState::Disconnected {
            return;
        }

        if let Err(e) = session.write_bytes(&self.framing.leave_request()) {
            log::warn!("Failed to leave bootloader cleanly: {}", e);
        } else {
            log::debug!("bootloader: leave request sent");
        }

        if self.state != BootloaderState::Done {
            self.set_state(BootloaderState::Aborted);
        }
    }
}
