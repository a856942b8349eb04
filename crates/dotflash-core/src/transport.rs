//! Byte channel abstraction
//!
//! A [`Transport`] is an open byte channel to one device; a [`Connector`]
//! knows how to open one for a port name. The serial implementation lives
//! in `dotflash-serial`, the simulated device in `dotflash-sim`.

use std::time::Duration;

use crate::config::LinkSettings;
use crate::error::Result;

/// Transport trait for reading and writing bytes
pub trait Transport {
    /// Write all bytes to the transport
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read with timeout
    ///
    /// Reads up to `buf.len()` bytes, waiting up to `timeout`.
    /// Returns the number of bytes read, or 0 if the timeout elapsed.
    fn read_nonblock(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Flush any buffered output
    fn flush(&mut self) -> Result<()>;

    /// Assert a reset signal towards the device
    ///
    /// Mbed interface chips reset the target MCU on a serial break.
    fn send_break(&mut self, duration: Duration) -> Result<()>;

    /// Drop any received but unread input
    fn discard_input(&mut self) -> Result<()>;
}

/// Opens transports by port name
pub trait Connector {
    /// Transport produced by this connector
    type Transport: Transport;

    /// Open `port` with the given link settings
    ///
    /// Fails with `Error::DeviceNotFound` if the port does not exist or
    /// cannot be opened, `Error::DeviceBusy` if the OS reports it in use.
    fn open(&self, port: &str, settings: &LinkSettings) -> Result<Self::Transport>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read_nonblock(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_nonblock(buf, timeout)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn send_break(&mut self, duration: Duration) -> Result<()> {
        (**self).send_break(duration)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }
}
