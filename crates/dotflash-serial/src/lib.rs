//! dotflash-serial - Serial port transport for dotflash
//!
//! Opens the Dot's USB serial interface (8N1, no flow control) and adapts it
//! to the [`Transport`] trait. The device reset is a line break on the
//! port, which the Dot's interface chip turns into a target reset.

use std::io::{Read, Write};
use std::time::Duration;

use dotflash_core::{Connector, Error, LinkSettings, Result, Transport};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

/// USB vendor ID of the ARM mbed interface chip used on Dot dev boards
pub const MBED_USB_VID: u16 = 0x0D28;

/// Opens serial ports by name
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl SerialConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

impl Connector for SerialConnector {
    type Transport = SerialTransport;

    fn open(&self, port: &str, settings: &LinkSettings) -> Result<SerialTransport> {
        SerialTransport::open(port, settings)
    }
}

/// Serial port transport
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    // Write timeout, reported when a write stalls
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial port with the given link settings
    pub fn open(device: &str, settings: &LinkSettings) -> Result<Self> {
        let port = serialport::new(device, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| map_open_error(device, e))?;

        log::info!("Opened serial port {} at {} baud", device, settings.baud_rate);

        Ok(Self {
            port,
            timeout: settings.timeout,
        })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port
            .write_all(data)
            .map_err(|e| map_io_error(e, self.timeout))
    }

    fn read_nonblock(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let old_timeout = self.port.timeout();
        self.port.set_timeout(timeout).map_err(map_port_error)?;

        let result = match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(map_io_error(e, timeout)),
        };

        self.port.set_timeout(old_timeout).map_err(map_port_error)?;
        result
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(|e| map_io_error(e, self.timeout))
    }

    fn send_break(&mut self, duration: Duration) -> Result<()> {
        log::debug!("Sending {} ms break", duration.as_millis());
        self.port.set_break().map_err(map_port_error)?;
        std::thread::sleep(duration);
        self.port.clear_break().map_err(map_port_error)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(map_port_error)
    }
}

fn map_port_error(e: serialport::Error) -> Error {
    Error::Communication(format!("serial port error: {}", e))
}

fn map_io_error(e: std::io::Error, timeout: Duration) -> Error {
    match e.kind() {
        std::io::ErrorKind::TimedOut => Error::Timeout(timeout.as_millis() as u64),
        _ => Error::from(e),
    }
}

/// A port that cannot be opened is either held by another process or not
/// there for us, whatever the OS reason
fn map_open_error(device: &str, e: serialport::Error) -> Error {
    let busy = e.description.to_ascii_lowercase().contains("busy");
    if busy {
        Error::DeviceBusy(format!("{}: {}", device, e.description))
    } else {
        Error::DeviceNotFound(format!("{}: {}", device, e.description))
    }
}

/// A serial port found on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS name of the port
    pub name: String,
    /// USB vendor and product ID, for USB ports
    pub usb_id: Option<(u16, u16)>,
    /// USB product string, if reported
    pub product: Option<String>,
}

impl PortInfo {
    /// Whether the port belongs to an mbed interface chip (Dot dev boards)
    pub fn is_likely_dot(&self) -> bool {
        matches!(self.usb_id, Some((MBED_USB_VID, _)))
    }
}

/// List the serial ports of the host
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::Communication(format!("cannot enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .map(|p| match p.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: p.port_name,
                usb_id: Some((usb.vid, usb.pid)),
                product: usb.product,
            },
            _ => PortInfo {
                name: p.port_name,
                usb_id: None,
                product: None,
            },
        })
        .collect())
}
