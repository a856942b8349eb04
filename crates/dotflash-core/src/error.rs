//! Error types for dotflash-core
//!
//! A single error enum covers every layer of a flash transaction. Errors are
//! split into two families: transient I/O-class errors that the retry
//! policies may absorb, and structural errors that end the transaction
//! immediately.

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Firmware image is unreadable, empty, too large or fails its checksum
    #[error("invalid firmware image: {0}")]
    InvalidImage(String),

    /// Communication port could not be opened
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Communication port is already held by another session
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// I/O failure or protocol violation on the device channel
    #[error("communication error: {0}")]
    Communication(String),

    /// A blocking read or write exceeded its timeout
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Device did not acknowledge bootloader entry in time
    #[error("bootloader handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    /// Device reported a checksum mismatch for a block
    #[error("block {index} rejected by device{}", reason_suffix(.reason))]
    BlockRejected {
        /// Index of the rejected block
        index: u32,
        /// Reason reported by the device, if any
        reason: Option<String>,
    },

    /// Device-side checksum of the written range differs from the image
    #[error("verification failed: expected CRC32 0x{expected:08X}, device reported 0x{actual:08X}")]
    VerificationMismatch {
        /// Checksum of the firmware image
        expected: u32,
        /// Checksum reported by the device
        actual: u32,
    },

    /// Bootloader entry failed on every attempt
    #[error("device not responding after {attempts} attempt(s): {last}")]
    DeviceNotResponding {
        /// Number of handshake attempts made
        attempts: u32,
        /// Last underlying cause
        last: Box<Error>,
    },

    /// A block could not be written within the per-block retry budget
    #[error("transfer failed at block {block} after {attempts} attempt(s): {last}")]
    TransferFailed {
        /// Index of the block that failed
        block: u32,
        /// Number of attempts made for that block
        attempts: u32,
        /// Last underlying cause
        last: Box<Error>,
    },

    /// Transaction was cancelled between blocks
    #[error("cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) if !r.is_empty() => format!(": {}", r),
        _ => String::new(),
    }
}

impl Error {
    /// Whether a retry policy may absorb this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Communication(_) | Error::Timeout(_) | Error::BlockRejected { .. }
        )
    }

    /// Whether a failed connect (open, reset, bootloader entry) with this
    /// error is worth another attempt
    ///
    /// A missing port may reappear once the USB interface re-enumerates; a
    /// busy one will not be released by retrying.
    pub fn is_handshake_retryable(&self) -> bool {
        matches!(
            self,
            Error::HandshakeTimeout(_)
                | Error::Communication(_)
                | Error::Timeout(_)
                | Error::DeviceNotFound(_)
        )
    }

    /// The innermost cause, looking through the retry wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::DeviceNotResponding { last, .. } | Error::TransferFailed { last, .. } => {
                last.root_cause()
            }
            other => other,
        }
    }
}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Communication(e.to_string())
    }
}
