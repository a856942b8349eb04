//! Terminal progress display

use dotflash_core::{Error, FlashProgress, FlashReport, TransactionState};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter using indicatif progress bars
pub struct IndicatifProgress {
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, pass: &str) {
        self.clear();
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                    pass
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        self.clear();
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn clear(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_and_clear();
        }
    }
}

impl FlashProgress for IndicatifProgress {
    fn state_changed(&mut self, state: TransactionState) {
        match state {
            TransactionState::Connecting
            | TransactionState::EnteringBootloader
            | TransactionState::Verifying => {
                self.create_spinner(format!("{}...", state));
            }
            // The bar appears once the block count is known
            TransactionState::Transferring => {}
            TransactionState::Idle | TransactionState::Succeeded | TransactionState::Failed => {}
        }
    }

    fn transfer_started(&mut self, total_bytes: usize, blocks: usize) {
        self.create_bar(total_bytes as u64, &format!("Writing {} blocks", blocks));
    }

    fn block_written(&mut self, bytes_written: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(bytes_written as u64);
        }
    }

    fn retrying(&mut self, what: &str, attempt: u32, error: &Error) {
        let line = format!("{} attempt {} failed ({}), retrying", what, attempt, error);
        match &self.current_bar {
            Some(pb) => pb.println(line),
            None => eprintln!("{}", line),
        }
    }

    fn finished(&mut self, report: &FlashReport) {
        if let Some(pb) = self.current_bar.take() {
            match report.state {
                TransactionState::Succeeded => pb.finish_with_message("done"),
                _ => pb.abandon_with_message("failed"),
            }
        }
    }
}
