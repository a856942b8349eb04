//! dotflash-core - Flash transaction engine for Multitech Dot modules
//!
//! This crate implements everything needed to flash one firmware image onto
//! one Multitech xDot or mDot over a byte channel, independent of how that
//! channel is opened:
//!
//! - [`image`] - loading and validating firmware images
//! - [`session`] - exclusive, scoped ownership of a device channel
//! - [`protocol`] - the bootloader state machine and its framing
//! - [`orchestrator`] - the retrying flash-and-verify transaction
//!
//! # Example
//!
//! ```ignore
//! use dotflash_core::{DeviceType, FlashConfig, FlashOrchestrator, NoProgress, PortLocks};
//!
//! let config = FlashConfig::new("firmware.bin", "/dev/ttyACM0", DeviceType::Xdot);
//! let mut orchestrator = FlashOrchestrator::new(config, connector, PortLocks::new());
//! match orchestrator.run(&mut NoProgress) {
//!     Ok(report) => println!("Flashed {} bytes", report.image_size),
//!     Err(failure) => eprintln!("{}", failure),
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod checksum;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{ConfigFile, FlashConfig, LinkSettings, ProtocolTimeouts, RetryPolicy};
pub use control::{CancelToken, Sleeper, ThreadSleeper};
pub use device::{BootloaderCommands, DeviceProfile, DeviceType};
pub use error::{Error, Result};
pub use image::{FirmwareImage, ImageReader, TransferBlock};
pub use orchestrator::{FlashFailure, FlashOrchestrator, FlashReport, TransactionState};
pub use progress::{FlashProgress, NoProgress};
pub use session::{DeviceHandle, DeviceSession, PortLease, PortLocks};
pub use transport::{Connector, Transport};
