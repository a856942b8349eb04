//! dotflash-sim - Simulated Dot bootloader
//!
//! This crate provides an in-memory device that speaks the bootloader line
//! protocol, with injectable faults (silent handshakes, rejected blocks,
//! lost acknowledgments, wrong checksums). It's useful for testing and
//! development without real hardware.
//!
//! A [`SimDevice`] is both the device and the [`Connector`] that opens it;
//! clones share the same device, so a test can keep one handle to inspect
//! [`SimStats`] after handing another to the orchestrator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dotflash_core::checksum::crc32;
use dotflash_core::protocol::{LineFraming, Request};
use dotflash_core::{Connector, DeviceType, Error, LinkSettings, Result, Sleeper, Transport};

/// Faults to inject into the simulated bootloader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Enter requests to ignore before answering (`u32::MAX`: never answer)
    pub silent_handshakes: u32,
    /// Block index -> number of times to answer NAK
    pub rejections: BTreeMap<u32, u32>,
    /// Block index -> number of times to write the block but lose the ACK
    pub dropped_acks: BTreeMap<u32, u32>,
    /// Checksum requests to answer wrongly (`u32::MAX`: always)
    pub bad_checksums: u32,
    /// Acknowledge blocks with an index one too high
    pub skip_ack_index: bool,
}

/// Counters of what the device has seen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Successful opens of the port
    pub opens: u32,
    /// Reset signals received
    pub resets: u32,
    /// Enter requests received
    pub handshakes: u32,
    /// Block index -> write requests received
    pub block_writes: BTreeMap<u32, u32>,
    /// Checksum requests received
    pub checksum_requests: u32,
    /// Leave requests received
    pub leaves: u32,
}

impl SimStats {
    /// Write requests received for one block
    pub fn writes_for(&self, index: u32) -> u32 {
        self.block_writes.get(&index).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Application,
    Bootloader,
}

#[derive(Debug)]
struct PendingWrite {
    index: u32,
    offset: u32,
    len: usize,
    crc: u32,
}

#[derive(Debug)]
struct SimInner {
    framing: LineFraming,
    present: bool,
    banner: Option<String>,
    faults: Faults,
    stats: SimStats,
    flash: Vec<u8>,
    mode: Mode,
    next_index: u32,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    pending: Option<PendingWrite>,
}

impl SimInner {
    fn reply(&mut self, line: &str) {
        log::trace!("sim: reply {:?}", line);
        self.outbox.extend_from_slice(line.as_bytes());
        self.outbox.extend_from_slice(b"\r\n");
    }

    fn reset(&mut self) {
        self.stats.resets += 1;
        self.mode = Mode::Application;
        self.next_index = 0;
        self.inbox.clear();
        self.outbox.clear();
        self.pending = None;
    }

    /// Consume complete requests from the inbox
    fn process(&mut self) {
        loop {
            if let Some(pending) = self.pending.take() {
                if self.inbox.len() < pending.len {
                    self.pending = Some(pending);
                    return;
                }
                let payload: Vec<u8> = self.inbox.drain(..pending.len).collect();
                self.handle_write(pending, &payload);
                continue;
            }

            let Some(pos) = self.inbox.iter().position(|&b| b == b'\n') else {
                return;
            };
            let line: Vec<u8> = self.inbox.drain(..=pos).collect();
            match self.framing.parse_request(&line) {
                Some(request) => self.handle_request(request),
                None => log::trace!("sim: ignoring {:?}", String::from_utf8_lossy(&line)),
            }
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Enter => {
                self.stats.handshakes += 1;
                if self.faults.silent_handshakes > 0 {
                    if self.faults.silent_handshakes != u32::MAX {
                        self.faults.silent_handshakes -= 1;
                    }
                    return;
                }
                if let Some(banner) = self.banner.clone() {
                    self.reply(&banner);
                }
                self.mode = Mode::Bootloader;
                self.next_index = 0;
                let ready = self.framing.ready_reply();
                self.outbox.extend_from_slice(&ready);
            }
            Request::Write {
                index,
                offset,
                len,
                crc,
            } => {
                self.pending = Some(PendingWrite {
                    index,
                    offset,
                    len: len as usize,
                    crc,
                });
            }
            Request::Checksum { offset, len } => {
                self.stats.checksum_requests += 1;
                if self.mode != Mode::Bootloader {
                    self.reply("ERR not in bootloader");
                    return;
                }
                let (start, end) = (offset as usize, offset as usize + len as usize);
                if end > self.flash.len() {
                    self.reply("ERR range out of bounds");
                    return;
                }
                let mut crc = crc32(&self.flash[start..end]);
                if self.faults.bad_checksums > 0 {
                    if self.faults.bad_checksums != u32::MAX {
                        self.faults.bad_checksums -= 1;
                    }
                    crc = !crc;
                }
                self.reply(&format!("CRC {:08X}", crc));
            }
            Request::Leave => {
                self.stats.leaves += 1;
                self.mode = Mode::Application;
            }
        }
    }

    fn handle_write(&mut self, req: PendingWrite, payload: &[u8]) {
        *self.stats.block_writes.entry(req.index).or_insert(0) += 1;

        if self.mode != Mode::Bootloader {
            self.reply("ERR not in bootloader");
            return;
        }

        if let Some(remaining) = self.faults.rejections.get_mut(&req.index) {
            if *remaining > 0 {
                *remaining -= 1;
                self.reply("NAK crc mismatch");
                return;
            }
        }

        // A resend of the last acknowledged block is accepted again
        let is_resend = req.index + 1 == self.next_index;
        if req.index != self.next_index && !is_resend {
            self.reply(&format!("ERR expected block {}", self.next_index));
            return;
        }
        if crc32(payload) != req.crc {
            self.reply("NAK crc mismatch");
            return;
        }
        let end = req.offset as usize + req.len;
        if end > self.flash.len() {
            self.reply("ERR write beyond flash");
            return;
        }

        self.flash[req.offset as usize..end].copy_from_slice(payload);
        if !is_resend {
            self.next_index += 1;
        }

        if let Some(remaining) = self.faults.dropped_acks.get_mut(&req.index) {
            if *remaining > 0 {
                *remaining -= 1;
                return;
            }
        }

        let acked = if self.faults.skip_ack_index {
            req.index + 1
        } else {
            req.index
        };
        self.reply(&format!("ACK {}", acked));
    }
}

fn lock(inner: &Mutex<SimInner>) -> MutexGuard<'_, SimInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Simulated Dot module
#[derive(Debug, Clone)]
pub struct SimDevice {
    inner: Arc<Mutex<SimInner>>,
}

impl SimDevice {
    /// A healthy device of the given type
    pub fn new(device: DeviceType) -> Self {
        let profile = device.profile();
        let inner = SimInner {
            framing: LineFraming::new(profile.commands()),
            present: true,
            banner: Some(format!("{} bootloader", profile.name)),
            faults: Faults::default(),
            stats: SimStats::default(),
            flash: vec![0xFF; profile.flash_capacity as usize],
            mode: Mode::Application,
            next_index: 0,
            inbox: Vec::new(),
            outbox: Vec::new(),
            pending: None,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Build a device from a short fault description
    ///
    /// Accepted: `ok` (or empty), `silent`, `absent`, `bad-crc`,
    /// `reject-block-N`, `drop-ack-N`.
    pub fn from_fault(device: DeviceType, fault: &str) -> Result<Self> {
        let sim = Self::new(device);
        let fault = fault.trim();
        let block_arg = |prefix: &str| -> Option<Result<u32>> {
            fault.strip_prefix(prefix).map(|n| {
                n.parse()
                    .map_err(|_| Error::Config(format!("invalid block index in '{}'", fault)))
            })
        };

        if fault.is_empty() || fault == "ok" {
            Ok(sim)
        } else if fault == "silent" {
            Ok(sim.never_answer_handshake())
        } else if fault == "absent" {
            Ok(sim.absent())
        } else if fault == "bad-crc" {
            Ok(sim.corrupt_checksums(u32::MAX))
        } else if let Some(index) = block_arg("reject-block-") {
            Ok(sim.reject_block(index?, 1))
        } else if let Some(index) = block_arg("drop-ack-") {
            Ok(sim.drop_ack(index?, 1))
        } else {
            Err(Error::Config(format!("unknown simulator fault '{}'", fault)))
        }
    }

    fn update(self, f: impl FnOnce(&mut SimInner)) -> Self {
        f(&mut lock(&self.inner));
        self
    }

    /// The port cannot be opened
    pub fn absent(self) -> Self {
        self.update(|s| s.present = false)
    }

    /// Never answer the enter request
    pub fn never_answer_handshake(self) -> Self {
        self.update(|s| s.faults.silent_handshakes = u32::MAX)
    }

    /// Ignore the first `count` enter requests
    pub fn ignore_handshakes(self, count: u32) -> Self {
        self.update(|s| s.faults.silent_handshakes = count)
    }

    /// Reject block `index` the first `times` it is sent
    pub fn reject_block(self, index: u32, times: u32) -> Self {
        self.update(|s| {
            s.faults.rejections.insert(index, times);
        })
    }

    /// Write block `index` but lose its acknowledgment `times` times
    pub fn drop_ack(self, index: u32, times: u32) -> Self {
        self.update(|s| {
            s.faults.dropped_acks.insert(index, times);
        })
    }

    /// Report a wrong checksum for the next `times` requests
    pub fn corrupt_checksums(self, times: u32) -> Self {
        self.update(|s| s.faults.bad_checksums = times)
    }

    /// Acknowledge every block with the wrong index
    pub fn skip_ack_index(self) -> Self {
        self.update(|s| s.faults.skip_ack_index = true)
    }

    /// Boot banner printed before the ready line, if any
    pub fn with_banner(self, banner: Option<&str>) -> Self {
        let banner = banner.map(str::to_string);
        self.update(|s| s.banner = banner)
    }

    /// Snapshot of the device counters
    pub fn stats(&self) -> SimStats {
        lock(&self.inner).stats.clone()
    }

    /// Copy of the first `len` bytes of flash
    pub fn flash(&self, len: usize) -> Vec<u8> {
        let inner = lock(&self.inner);
        let len = len.min(inner.flash.len());
        inner.flash[..len].to_vec()
    }

    /// Whether the device is currently in bootloader mode
    pub fn in_bootloader(&self) -> bool {
        lock(&self.inner).mode == Mode::Bootloader
    }
}

impl Connector for SimDevice {
    type Transport = SimTransport;

    fn open(&self, port: &str, settings: &LinkSettings) -> Result<SimTransport> {
        let mut inner = lock(&self.inner);
        if !inner.present {
            return Err(Error::DeviceNotFound(format!("{}: no such device", port)));
        }
        inner.stats.opens += 1;
        log::debug!("sim: opened {} at {} baud", port, settings.baud_rate);
        Ok(SimTransport {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Open channel to a [`SimDevice`]
#[derive(Debug)]
pub struct SimTransport {
    inner: Arc<Mutex<SimInner>>,
}

impl Transport for SimTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.inbox.extend_from_slice(data);
        inner.process();
        Ok(())
    }

    fn read_nonblock(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        // The simulated device answers synchronously, so an empty outbox
        // means the wait would time out
        let mut inner = lock(&self.inner);
        let n = inner.outbox.len().min(buf.len());
        buf[..n].copy_from_slice(&inner.outbox[..n]);
        inner.outbox.drain(..n);
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn send_break(&mut self, _duration: Duration) -> Result<()> {
        lock(&self.inner).reset();
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        lock(&self.inner).outbox.clear();
        Ok(())
    }
}

/// Sleeper that records delays instead of waiting
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far
    pub fn delays(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sum of all requested delays
    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
    }
}
