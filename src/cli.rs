//! CLI argument parsing

use clap::{Parser, ValueEnum};
use dotflash_core::config::parse_size;
use dotflash_core::image::parse_checksum;
use dotflash_core::DeviceType;
use std::path::PathBuf;

/// Module type selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    /// Multitech xDot
    Xdot,
    /// Multitech mDot
    Mdot,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Xdot => DeviceType::Xdot,
            DeviceArg::Mdot => DeviceType::Mdot,
        }
    }
}

#[derive(Parser)]
#[command(name = "flashit")]
#[command(author, version, about = "Firmware flasher for Multitech xDot and mDot modules", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Firmware image to flash
    #[arg(short, long, required_unless_present = "list_ports")]
    pub image: Option<PathBuf>,

    /// Serial port of the module (e.g. /dev/ttyACM0), or sim:[fault] for
    /// the simulated device
    #[arg(short, long, required_unless_present = "list_ports")]
    pub port: Option<String>,

    /// Module type
    #[arg(short = 't', long = "type", value_enum, required_unless_present = "list_ports")]
    pub device: Option<DeviceArg>,

    /// Baud rate (defaults to the module's)
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Transfer block size (e.g. 1024, 0x800, "2 KiB")
    #[arg(long, value_parser = parse_size)]
    pub block_size: Option<u32>,

    /// Expected CRC-32 of the image (hex); overrides a <image>.crc32 file
    #[arg(long, value_parser = parse_checksum)]
    pub crc32: Option<u32>,

    /// Configuration file (TOML format)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long, conflicts_with_all = ["image", "port", "device"])]
    pub list_ports: bool,
}
