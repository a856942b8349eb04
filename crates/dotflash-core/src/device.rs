//! Supported Multitech Dot modules
//!
//! Each module type carries a static profile: the application flash
//! capacity an image must fit in, the default serial baud rate of the Mbed
//! interface, and the command words its bootloader speaks.

use core::fmt;
use core::str::FromStr;

use crate::error::Error;

/// Multitech Dot module type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// xDot (STM32L151CCU6, 256 KiB flash)
    Xdot,
    /// mDot (STM32F411RET, 512 KiB flash)
    Mdot,
}

/// Bootloader command words and acknowledgment line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderCommands {
    /// Command that requests bootloader mode after reset
    pub enter: String,
    /// Line the bootloader prints once it accepts blocks
    pub ready: String,
    /// Block write command
    pub write: String,
    /// Checksum request command
    pub checksum: String,
    /// Leave bootloader and start the application
    pub leave: String,
}

/// Static description of a module type
#[derive(Debug, Clone, Copy)]
pub struct DeviceProfile {
    /// Device type this profile describes
    pub device: DeviceType,
    /// Human readable name
    pub name: &'static str,
    /// Bytes available to the application image
    pub flash_capacity: u32,
    /// Default baud rate of the interface serial port
    pub default_baud: u32,
    /// Default transfer block size
    pub default_block_size: usize,
    enter: &'static str,
    ready: &'static str,
    write: &'static str,
    checksum: &'static str,
    leave: &'static str,
}

impl DeviceProfile {
    /// Bootloader commands as owned, overridable values
    pub fn commands(&self) -> BootloaderCommands {
        BootloaderCommands {
            enter: self.enter.to_string(),
            ready: self.ready.to_string(),
            write: self.write.to_string(),
            checksum: self.checksum.to_string(),
            leave: self.leave.to_string(),
        }
    }
}

static XDOT: DeviceProfile = DeviceProfile {
    device: DeviceType::Xdot,
    name: "Multitech xDot",
    flash_capacity: 256 * 1024,
    default_baud: 115_200,
    default_block_size: 1024,
    enter: "BOOT",
    ready: "READY",
    write: "WRITE",
    checksum: "CRC",
    leave: "RUN",
};

static MDOT: DeviceProfile = DeviceProfile {
    device: DeviceType::Mdot,
    name: "Multitech mDot",
    flash_capacity: 512 * 1024,
    default_baud: 115_200,
    default_block_size: 2048,
    enter: "BOOT",
    ready: "READY",
    write: "WRITE",
    checksum: "CRC",
    leave: "RUN",
};

impl DeviceType {
    /// All supported device types
    pub const ALL: [DeviceType; 2] = [DeviceType::Xdot, DeviceType::Mdot];

    /// Static profile of this device type
    pub fn profile(self) -> &'static DeviceProfile {
        match self {
            DeviceType::Xdot => &XDOT,
            DeviceType::Mdot => &MDOT,
        }
    }

    /// Short name as used on the command line
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Xdot => "xdot",
            DeviceType::Mdot => "mdot",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xdot" => Ok(DeviceType::Xdot),
            "mdot" => Ok(DeviceType::Mdot),
            other => Err(Error::Config(format!(
                "unknown device type '{}' (expected xdot or mdot)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_type() {
        assert_eq!("xdot".parse::<DeviceType>().unwrap(), DeviceType::Xdot);
        assert_eq!("MDOT".parse::<DeviceType>().unwrap(), DeviceType::Mdot);
        assert!("ndot".parse::<DeviceType>().is_err());
    }

    #[test]
    fn test_profiles() {
        assert_eq!(DeviceType::Xdot.profile().flash_capacity, 256 * 1024);
        assert_eq!(DeviceType::Mdot.profile().flash_capacity, 512 * 1024);
        for device in DeviceType::ALL {
            let profile = device.profile();
            assert_eq!(profile.device, device);
            assert!(profile.default_block_size > 0);
            assert!(profile.commands().enter.len() > 0);
        }
    }
}
