//! Progress reporting for flash transactions

use crate::error::Error;
use crate::orchestrator::{FlashReport, TransactionState};

/// Callback for progress reporting during a flash transaction
pub trait FlashProgress {
    /// Called on every transaction state change
    fn state_changed(&mut self, state: TransactionState);

    /// Called when a transfer pass starts
    fn transfer_started(&mut self, total_bytes: usize, blocks: usize);

    /// Called after each acknowledged block
    fn block_written(&mut self, bytes_written: usize);

    /// Called before an operation is retried
    fn retrying(&mut self, what: &str, attempt: u32, error: &Error);

    /// Called once the transaction reached `Succeeded` or `Failed`
    fn finished(&mut self, report: &FlashReport);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn state_changed(&mut self, _state: TransactionState) {}
    fn transfer_started(&mut self, _total_bytes: usize, _blocks: usize) {}
    fn block_written(&mut self, _bytes_written: usize) {}
    fn retrying(&mut self, _what: &str, _attempt: u32, _error: &Error) {}
    fn finished(&mut self, _report: &FlashReport) {}
}
