//! Flash transaction orchestration
//!
//! [`FlashOrchestrator`] drives one complete flash-and-verify transaction:
//!
//! 1. Load and validate the image. No device is contacted if this fails.
//! 2. Open the session, reset the device and enter the bootloader, all
//!    retried together with backoff per the handshake [`RetryPolicy`]. A
//!    busy port fails at once.
//! 3. Stream every block in order, retrying single blocks per the block
//!    [`RetryPolicy`]. Partially written flash is not rolled back.
//! 4. Verify the device checksum. On mismatch the whole transfer is redone
//!    up to `verify_retries` times.
//! 5. Leave the bootloader.
//!
//! [`RetryPolicy`]: crate::config::RetryPolicy

use core::fmt;
use std::time::{Duration, Instant};

use crate::config::FlashConfig;
use crate::control::{CancelToken, Sleeper, ThreadSleeper};
use crate::device::DeviceType;
use crate::error::{Error, Result};
use crate::image::{FirmwareImage, ImageReader};
use crate::progress::FlashProgress;
use crate::protocol::{Bootloader, Framing, LineFraming};
use crate::session::{DeviceSession, PortLocks};
use crate::transport::Connector;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not started, or loading the image
    Idle,
    /// Opening the device session
    Connecting,
    /// Resetting the device into its bootloader
    EnteringBootloader,
    /// Streaming blocks
    Transferring,
    /// Comparing device and image checksums
    Verifying,
    /// Image written and verified
    Succeeded,
    /// Transaction ended with an error
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "loading image",
            Self::Connecting => "connecting",
            Self::EnteringBootloader => "entering bootloader",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Summary of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    /// Final state (`Succeeded` or `Failed`)
    pub state: TransactionState,
    /// Port the device was attached to
    pub port: String,
    /// Target device type
    pub device: DeviceType,
    /// Image size in bytes (0 if the image never loaded)
    pub image_size: u32,
    /// Image CRC-32
    pub image_checksum: u32,
    /// Number of transfer blocks
    pub block_count: usize,
    /// Attempts per block during the last transfer pass
    pub block_attempts: Vec<u32>,
    /// Bootloader entry attempts over all passes
    pub handshake_attempts: u32,
    /// Transfer passes started (more than one after a verification mismatch)
    pub transfer_passes: u32,
    /// Wall-clock duration of the transaction
    pub elapsed: Duration,
}

impl FlashReport {
    /// Empty report for a transaction on `config`
    pub fn new(config: &FlashConfig) -> Self {
        Self {
            state: TransactionState::Idle,
            port: config.port.clone(),
            device: config.device,
            image_size: 0,
            image_checksum: 0,
            block_count: 0,
            block_attempts: Vec::new(),
            handshake_attempts: 0,
            transfer_passes: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Total block retries during the last pass
    pub fn block_retries(&self) -> u32 {
        self.block_attempts
            .iter()
            .map(|&a| a.saturating_sub(1))
            .sum()
    }
}

/// Terminal failure of a transaction
#[derive(Debug)]
pub struct FlashFailure {
    /// Stage the transaction had reached
    pub stage: TransactionState,
    /// Last underlying cause
    pub error: Error,
    /// What was done before failing
    pub report: FlashReport,
}

impl fmt::Display for FlashFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flash failed while {}: {}", self.stage, self.error)
    }
}

impl std::error::Error for FlashFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Runs flash transactions against one configured target
pub struct FlashOrchestrator<C: Connector> {
    config: FlashConfig,
    connector: C,
    locks: PortLocks,
    sleeper: Box<dyn Sleeper>,
    cancel: CancelToken,
    state: TransactionState,
}

impl<C: Connector> FlashOrchestrator<C> {
    /// Create an orchestrator
    ///
    /// `locks` is shared with any other orchestrator that may open the same
    /// ports.
    pub fn new(config: FlashConfig, connector: C, locks: PortLocks) -> Self {
        Self {
            config,
            connector,
            locks,
            sleeper: Box::new(ThreadSleeper),
            cancel: CancelToken::new(),
            state: TransactionState::Idle,
        }
    }

    /// Replace the sleeper used for retry backoff
    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Use an externally controlled cancellation token
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current transaction state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Transaction configuration
    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Connector used to open sessions
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run one complete transaction
    ///
    /// Every run starts from `Idle`; nothing carries over from earlier runs.
    pub fn run(
        &mut self,
        progress: &mut dyn FlashProgress,
    ) -> core::result::Result<FlashReport, FlashFailure> {
        let started = Instant::now();
        self.state = TransactionState::Idle;
        let mut report = FlashReport::new(&self.config);

        let result = self.execute(&mut report, progress);
        report.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.transition(TransactionState::Succeeded, progress);
                report.state = TransactionState::Succeeded;
                log::info!(
                    "Flashed {} bytes to {} on {} in {:.1}s",
                    report.image_size,
                    report.device,
                    report.port,
                    report.elapsed.as_secs_f32()
                );
                progress.finished(&report);
                Ok(report)
            }
            Err(error) => {
                let stage = self.state;
                self.transition(TransactionState::Failed, progress);
                report.state = TransactionState::Failed;
                log::error!("Flash failed while {}: {}", stage, error);
                progress.finished(&report);
                Err(FlashFailure {
                    stage,
                    error,
                    report,
                })
            }
        }
    }

    fn execute(&mut self, report: &mut FlashReport, progress: &mut dyn FlashProgress) -> Result<()> {
        self.config.validate()?;

        let image = ImageReader::new(self.config.capacity())
            .with_expected_checksum(self.config.expected_checksum)
            .load(&self.config.image)?;
        report.image_size = image.size();
        report.image_checksum = image.checksum();
        report.block_count = image.block_count(self.config.block_size);

        self.check_cancelled()?;
        self.flash_image(&image, report, progress)
    }

    fn flash_image(
        &mut self,
        image: &FirmwareImage,
        report: &mut FlashReport,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        // Opened lazily by `connect`, dropped (and the port released) on return
        let mut session: Option<DeviceSession<C::Transport>> = None;
        let max_passes = self.config.verify_retries.saturating_add(1);
        let mut pass = 0;

        loop {
            pass += 1;
            report.transfer_passes = pass;
            let mut bootloader = match self.connect(&mut session, report, progress) {
                Ok(bootloader) => bootloader,
                Err(e) => {
                    // The previous pass left the device in its bootloader
                    if pass > 1 {
                        if let Some(session) = session.as_mut() {
                            self.leave_bootloader(session);
                        }
                    }
                    return Err(e);
                }
            };
            let Some(session) = session.as_mut() else {
                return Err(Error::Communication("device session not open".into()));
            };

            let outcome = match self.transfer(session, &mut bootloader, image, report, progress) {
                Ok(()) => {
                    self.transition(TransactionState::Verifying, progress);
                    bootloader.verify(session, image)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    bootloader.abort(session);
                    return Ok(());
                }
                Err(e @ Error::VerificationMismatch { .. }) if pass < max_passes => {
                    log::warn!("{}; re-flashing (pass {} of {})", e, pass + 1, max_passes);
                    progress.retrying("transfer", pass, &e);
                }
                Err(e) => {
                    bootloader.abort(session);
                    return Err(e);
                }
            }
        }
    }

    /// Open the port if needed, reset the device and enter its bootloader,
    /// with retries
    ///
    /// A port that cannot be opened (e.g. while the USB interface
    /// re-enumerates after a reset) is retried like a silent bootloader. A
    /// port held by another session is not.
    fn connect(
        &mut self,
        session: &mut Option<DeviceSession<C::Transport>>,
        report: &mut FlashReport,
        progress: &mut dyn FlashProgress,
    ) -> Result<Bootloader<LineFraming>> {
        let policy = self.config.handshake_retry.clone();
        let mut last = None;

        for attempt in 1..=policy.max_attempts {
            self.check_cancelled()?;
            report.handshake_attempts += 1;

            match self.try_connect(session, progress) {
                Ok(bootloader) => return Ok(bootloader),
                Err(e) if e.is_handshake_retryable() => {
                    log::warn!(
                        "Connection attempt {}/{} failed: {}",
                        attempt,
                        policy.max_attempts,
                        e
                    );
                    if attempt < policy.max_attempts {
                        progress.retrying("bootloader entry", attempt, &e);
                    }
                    if matches!(e, Error::Communication(_)) {
                        // Reopen a broken channel on the next attempt
                        *session = None;
                    }
                    // The device gets its settle time after the last attempt too
                    self.backoff(policy.delay_after(attempt));
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let timeout_ms = self.config.timeouts.handshake.as_millis() as u64;
        Err(Error::DeviceNotResponding {
            attempts: policy.max_attempts,
            last: Box::new(last.unwrap_or(Error::HandshakeTimeout(timeout_ms))),
        })
    }

    fn try_connect(
        &mut self,
        session: &mut Option<DeviceSession<C::Transport>>,
        progress: &mut dyn FlashProgress,
    ) -> Result<Bootloader<LineFraming>> {
        let session = match session.take() {
            Some(open) => session.insert(open),
            None => {
                self.transition(TransactionState::Connecting, progress);
                session.insert(DeviceSession::open(
                    &self.connector,
                    &self.locks,
                    &self.config.port,
                    self.config.link,
                )?)
            }
        };

        self.transition(TransactionState::EnteringBootloader, progress);
        let mut bootloader = Bootloader::new(
            LineFraming::new(self.config.commands.clone()),
            self.config.timeouts,
        );
        session.reset()?;
        bootloader.enter_bootloader(session)?;
        Ok(bootloader)
    }

    /// Best-effort leave request outside a running bootloader exchange
    fn leave_bootloader(&self, session: &mut DeviceSession<C::Transport>) {
        let framing = LineFraming::new(self.config.commands.clone());
        if let Err(e) = session.write_bytes(&framing.leave_request()) {
            log::warn!("Failed to leave bootloader cleanly: {}", e);
        }
    }

    /// Stream all blocks in order
    fn transfer(
        &mut self,
        session: &mut DeviceSession<C::Transport>,
        bootloader: &mut Bootloader<LineFraming>,
        image: &FirmwareImage,
        report: &mut FlashReport,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        self.transition(TransactionState::Transferring, progress);
        let block_size = self.config.block_size;
        let policy = self.config.block_retry.clone();
        report.block_attempts = vec![0; image.block_count(block_size)];
        progress.transfer_started(image.data().len(), report.block_attempts.len());

        for block in image.blocks(block_size) {
            let slot = block.index as usize;
            let mut attempt = 0;

            loop {
                attempt += 1;
                report.block_attempts[slot] = attempt;

                match bootloader.write_block(session, &block) {
                    Ok(()) => break,
                    Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                        log::warn!(
                            "Block {} attempt {}/{} failed: {}",
                            block.index,
                            attempt,
                            policy.max_attempts,
                            e
                        );
                        progress.retrying("block", attempt, &e);
                        self.backoff(policy.delay_after(attempt));
                        if let Err(e) = session.discard_input() {
                            log::debug!("Failed to discard input before retry: {}", e);
                        }
                    }
                    Err(e) if e.is_transient() => {
                        return Err(Error::TransferFailed {
                            block: block.index,
                            attempts: attempt,
                            last: Box::new(e),
                        })
                    }
                    Err(e) => return Err(e),
                }
            }

            progress.block_written(block.end() as usize);
            self.check_cancelled()?;
        }

        Ok(())
    }

    fn backoff(&mut self, delay: Duration) {
        if !delay.is_zero() {
            log::debug!("Waiting {} ms before retrying", delay.as_millis());
            self.sleeper.sleep(delay);
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            log::warn!("Cancellation requested");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn transition(&mut self, state: TransactionState, progress: &mut dyn FlashProgress) {
        if self.state != state {
            log::debug!("transaction: {} -> {}", self.state, state);
            self.state = state;
            progress.state_changed(state);
        }
    }
}
