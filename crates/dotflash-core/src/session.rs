//! Device session: exclusive ownership of one device channel
//!
//! A [`DeviceSession`] holds the opened transport and a lease on the port
//! name in a [`PortLocks`] registry. Both are released when the session is
//! dropped, whichever way the transaction ends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::LinkSettings;
use crate::error::{Error, Result};
use crate::transport::{Connector, Transport};

/// Longest line accepted from the device
pub const MAX_LINE_LEN: usize = 256;

/// How long the reset signal is held
pub const RESET_PULSE: Duration = Duration::from_millis(250);

/// Registry of ports currently held by a session
///
/// Clones share the same registry. A port can be leased by one session at
/// a time.
#[derive(Debug, Clone, Default)]
pub struct PortLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PortLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `port`, failing with `Error::DeviceBusy` if it is already held
    pub fn acquire(&self, port: &str) -> Result<PortLease> {
        let mut held = lock(&self.held);
        if !held.insert(port.to_string()) {
            return Err(Error::DeviceBusy(format!(
                "{} is already in use by another session",
                port
            )));
        }
        Ok(PortLease {
            port: port.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    /// Whether `port` is currently leased
    pub fn is_held(&self, port: &str) -> bool {
        lock(&self.held).contains(port)
    }
}

fn lock(held: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    // The set stays consistent even if a holder panicked
    held.lock().unwrap_or_else(|e| e.into_inner())
}

/// Lease on a port name, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.port);
    }
}

/// Identifies the endpoint a session talks to
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Port name
    pub port: String,
    /// Negotiated link settings
    pub settings: LinkSettings,
}

/// Open channel to a single device
pub struct DeviceSession<T: Transport> {
    // Field order matters: the transport closes before the lease is released
    transport: T,
    handle: DeviceHandle,
    pending: Vec<u8>,
    _lease: PortLease,
}

impl<T: Transport> DeviceSession<T> {
    /// Open a session on `port`
    ///
    /// The port is leased before the transport is opened, so a second
    /// session on the same port fails fast with `Error::DeviceBusy`.
    pub fn open<C>(
        connector: &C,
        locks: &PortLocks,
        port: &str,
        settings: LinkSettings,
    ) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        let lease = locks.acquire(port)?;
        let transport = connector.open(port, &settings)?;
        log::info!("Opened {} at {} baud", port, settings.baud_rate);

        Ok(Self::with_transport(transport, port, settings, lease))
    }

    /// Wrap an already opened transport
    pub fn with_transport(
        transport: T,
        port: &str,
        settings: LinkSettings,
        lease: PortLease,
    ) -> Self {
        Self {
            transport,
            handle: DeviceHandle {
                port: port.to_string(),
                settings,
            },
            pending: Vec::new(),
            _lease: lease,
        }
    }

    /// Endpoint of this session
    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Reset the device and drop anything it sent before
    pub fn reset(&mut self) -> Result<()> {
        log::debug!("Resetting device on {}", self.handle.port);
        self.transport.send_break(RESET_PULSE)?;
        self.discard_input()
    }

    /// Drop buffered and pending input
    pub fn discard_input(&mut self) -> Result<()> {
        self.pending.clear();
        self.transport.discard_input()
    }

    /// Write bytes to the device
    pub fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        log::trace!("tx {} bytes", buf.len());
        self.transport.write(buf)?;
        self.transport.flush()
    }

    /// Read one line, without its `\r\n` terminator
    ///
    /// Fails with `Error::Timeout` if no complete line arrives in time.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                // The terminator may arrive in the same chunk as the overflow
                if line.len() > MAX_LINE_LEN {
                    return Err(Error::Communication(format!(
                        "line exceeds {} bytes ({} received)",
                        MAX_LINE_LEN,
                        line.len()
                    )));
                }
                log::trace!("rx line {:?}", String::from_utf8_lossy(&line));
                return Ok(line);
            }

            if self.pending.len() > MAX_LINE_LEN {
                let len = self.pending.len();
                self.pending.clear();
                return Err(Error::Communication(format!(
                    "line exceeds {} bytes ({} received without terminator)",
                    MAX_LINE_LEN, len
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout.as_millis() as u64));
            }

            let n = self.transport.read_nonblock(&mut buf, remaining)?;
            if n == 0 {
                return Err(Error::Timeout(timeout.as_millis() as u64));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Close the session, releasing the port
    pub fn close(self) {}
}

impl<T: Transport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        log::debug!("Closing {}", self.handle.port);
    }
}
