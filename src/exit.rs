//! Process exit codes

use dotflash_core::{Error, FlashFailure, TransactionState};

/// Image flashed and verified
pub const SUCCESS: i32 = 0;
/// Configuration, usage and anything unclassified
pub const GENERAL: i32 = 1;
/// Image unreadable, empty, too large or not matching its checksum
pub const IMAGE: i32 = 2;
/// Port missing or held by someone else
pub const DEVICE_UNAVAILABLE: i32 = 3;
/// Bootloader never answered
pub const NOT_RESPONDING: i32 = 4;
/// Block transfer gave up
pub const TRANSFER: i32 = 5;
/// Device checksum differs from the image
pub const VERIFICATION: i32 = 6;
/// Stopped by the user
pub const CANCELLED: i32 = 7;

/// Exit code for an error returned from `main`
pub fn code_for(error: &(dyn std::error::Error + 'static)) -> i32 {
    if let Some(failure) = error.downcast_ref::<FlashFailure>() {
        failure_code(failure)
    } else if let Some(error) = error.downcast_ref::<Error>() {
        error_code(error)
    } else {
        GENERAL
    }
}

/// Exit code for a failed transaction
///
/// Link errors are attributed to the stage they happened in.
pub fn failure_code(failure: &FlashFailure) -> i32 {
    match (&failure.error, failure.stage) {
        (Error::Communication(_) | Error::Timeout(_), TransactionState::EnteringBootloader) => {
            NOT_RESPONDING
        }
        (Error::Communication(_) | Error::Timeout(_), TransactionState::Verifying) => {
            VERIFICATION
        }
        (error, _) => error_code(error),
    }
}

fn error_code(error: &Error) -> i32 {
    match error {
        Error::InvalidImage(_) => IMAGE,
        Error::DeviceNotFound(_) | Error::DeviceBusy(_) => DEVICE_UNAVAILABLE,
        // The port never came back while retrying
        Error::DeviceNotResponding { last, .. } if matches!(**last, Error::DeviceNotFound(_)) => {
            DEVICE_UNAVAILABLE
        }
        Error::DeviceNotResponding { .. } | Error::HandshakeTimeout(_) => NOT_RESPONDING,
        Error::TransferFailed { .. }
        | Error::BlockRejected { .. }
        | Error::Communication(_)
        | Error::Timeout(_) => TRANSFER,
        Error::VerificationMismatch { .. } => VERIFICATION,
        Error::Cancelled => CANCELLED,
        Error::Config(_) => GENERAL,
    }
}
