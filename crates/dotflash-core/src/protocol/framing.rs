//! Bootloader message framing
//!
//! The [`Framing`] trait turns bootloader operations into bytes and device
//! lines into [`Reply`] values. [`LineFraming`] is a line-oriented text
//! framing whose command words come from [`BootloaderCommands`]:
//!
//! ```text
//! host -> device                                device -> host
//! BOOT\n                                        READY
//! WRITE <index> <offset:08X> <len> <crc:08X>\n  ACK <index> | NAK [reason]
//!   followed by <len> raw payload bytes
//! CRC <offset:08X> <len>\n                      CRC <crc:08X>
//! RUN\n                                         (none)
//!                                               ERR <message> at any time
//! ```

use crate::device::BootloaderCommands;
use crate::image::TransferBlock;

/// A decoded device reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Block with this index was written
    Ack(u32),
    /// Block was rejected, optionally with a reason
    Nak(Option<String>),
    /// Device-side checksum
    Checksum(u32),
    /// Device reported an error
    Error(String),
    /// Anything else (boot banners, echo, noise)
    Unrecognized,
}

/// Encodes requests and decodes replies for one bootloader dialect
pub trait Framing {
    /// Request to enter bootloader mode
    fn enter_request(&self) -> Vec<u8>;

    /// Whether `line` is the bootloader's ready acknowledgment
    fn is_ready(&self, line: &[u8]) -> bool;

    /// Header and payload for one block
    fn block_request(&self, block: &TransferBlock<'_>) -> Vec<u8>;

    /// Request for the device checksum of `[offset, offset + len)`
    fn checksum_request(&self, offset: u32, len: u32) -> Vec<u8>;

    /// Request to leave the bootloader
    fn leave_request(&self) -> Vec<u8>;

    /// Decode one reply line
    fn parse_reply(&self, line: &[u8]) -> Reply;
}

/// Request as seen by the device side of [`LineFraming`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Enter bootloader mode
    Enter,
    /// Block header; `len` payload bytes follow
    Write {
        /// Block index
        index: u32,
        /// Byte offset
        offset: u32,
        /// Payload length
        len: u32,
        /// Payload CRC-32
        crc: u32,
    },
    /// Checksum request
    Checksum {
        /// Start offset
        offset: u32,
        /// Length in bytes
        len: u32,
    },
    /// Leave bootloader mode
    Leave,
}

/// Text line framing
#[derive(Debug, Clone)]
pub struct LineFraming {
    commands: BootloaderCommands,
}

impl LineFraming {
    /// Framing speaking the given command words
    pub fn new(commands: BootloaderCommands) -> Self {
        Self { commands }
    }

    /// Command words of this framing
    pub fn commands(&self) -> &BootloaderCommands {
        &self.commands
    }

    /// Decode a request header line (device side)
    pub fn parse_request(&self, line: &[u8]) -> Option<Request> {
        let line = core::str::from_utf8(line).ok()?.trim();
        let mut words = line.split_ascii_whitespace();
        let cmd = words.next()?;
        let args: Vec<&str> = words.collect();
        let c = &self.commands;

        if cmd == c.enter && args.is_empty() {
            Some(Request::Enter)
        } else if cmd == c.leave && args.is_empty() {
            Some(Request::Leave)
        } else if cmd == c.write && args.len() == 4 {
            Some(Request::Write {
                index: args[0].parse().ok()?,
                offset: u32::from_str_radix(args[1], 16).ok()?,
                len: args[2].parse().ok()?,
                crc: u32::from_str_radix(args[3], 16).ok()?,
            })
        } else if cmd == c.checksum && args.len() == 2 {
            Some(Request::Checksum {
                offset: u32::from_str_radix(args[0], 16).ok()?,
                len: args[1].parse().ok()?,
            })
        } else {
            None
        }
    }

    /// Encode the ready line (device side)
    pub fn ready_reply(&self) -> Vec<u8> {
        format!("{}\r\n", self.commands.ready).into_bytes()
    }
}

impl Framing for LineFraming {
    fn enter_request(&self) -> Vec<u8> {
        format!("{}\n", self.commands.enter).into_bytes()
    }

    fn is_ready(&self, line: &[u8]) -> bool {
        core::str::from_utf8(line)
            .map(|s| s.trim() == self.commands.ready)
            .unwrap_or(false)
    }

    fn block_request(&self, block: &TransferBlock<'_>) -> Vec<u8> {
        let header = format!(
            "{} {} {:08X} {} {:08X}\n",
            self.commands.write,
            block.index,
            block.offset,
            block.len(),
            block.checksum
        );
        let mut frame = Vec::with_capacity(header.len() + block.data.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(block.data);
        frame
    }

    fn checksum_request(&self, offset: u32, len: u32) -> Vec<u8> {
        format!("{} {:08X} {}\n", self.commands.checksum, offset, len).into_bytes()
    }

    fn leave_request(&self) -> Vec<u8> {
        format!("{}\n", self.commands.leave).into_bytes()
    }

    fn parse_reply(&self, line: &[u8]) -> Reply {
        let Ok(line) = core::str::from_utf8(line) else {
            return Reply::Unrecognized;
        };
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };

        match word {
            "ACK" => rest
                .parse()
                .map(Reply::Ack)
                .unwrap_or(Reply::Unrecognized),
            "NAK" => Reply::Nak((!rest.is_empty()).then(|| rest.to_string())),
            "ERR" => Reply::Error(rest.to_string()),
            w if w == self.commands.checksum => u32::from_str_radix(rest, 16)
                .map(Reply::Checksum)
                .unwrap_or(Reply::Unrecognized),
            _ => Reply::Unrecognized,
        }
    }
}
