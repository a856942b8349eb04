//! End-to-end flash transactions against the simulated bootloader

use std::cell::Cell;
use std::path::PathBuf;
use std::time::Duration;

use dotflash_core::checksum::crc32;
use dotflash_core::{
    CancelToken, Connector, DeviceType, Error, FlashConfig, FlashOrchestrator, FlashProgress,
    FlashReport, LinkSettings, NoProgress, PortLocks, Result, TransactionState,
};
use dotflash_sim::{RecordingSleeper, SimDevice, SimTransport};
use tempfile::TempDir;

const PORT: &str = "sim0";

/// 5 blocks of 1 KiB for an xDot, the last one partial
fn test_image() -> Vec<u8> {
    (0..4500u32).map(|i| (i * 7 + i / 256) as u8).collect()
}

fn write_image(dir: &TempDir, data: &[u8]) -> PathBuf {
    let path = dir.path().join("app.bin");
    std::fs::write(&path, data).unwrap();
    path
}

fn orchestrator(
    path: PathBuf,
    sim: &SimDevice,
    sleeper: &RecordingSleeper,
) -> FlashOrchestrator<SimDevice> {
    let config = FlashConfig::new(path, PORT, DeviceType::Xdot);
    FlashOrchestrator::new(config, sim.clone(), PortLocks::new()).with_sleeper(sleeper.clone())
}

#[derive(Default)]
struct Recorder {
    states: Vec<TransactionState>,
    bytes: Vec<usize>,
    retries: Vec<(String, u32)>,
    finished: Option<TransactionState>,
    cancel_after: Option<(usize, CancelToken)>,
    cancel_on_repass: Option<CancelToken>,
}

impl FlashProgress for Recorder {
    fn state_changed(&mut self, state: TransactionState) {
        self.states.push(state);
    }

    fn transfer_started(&mut self, _total_bytes: usize, _blocks: usize) {}

    fn block_written(&mut self, bytes_written: usize) {
        self.bytes.push(bytes_written);
        if let Some((after, token)) = &self.cancel_after {
            if self.bytes.len() == *after {
                token.cancel();
            }
        }
    }

    fn retrying(&mut self, what: &str, attempt: u32, _error: &Error) {
        self.retries.push((what.to_string(), attempt));
        if what == "transfer" {
            if let Some(token) = &self.cancel_on_repass {
                token.cancel();
            }
        }
    }

    fn finished(&mut self, report: &FlashReport) {
        self.finished = Some(report.state);
    }
}

#[test]
fn healthy_device_is_flashed_and_verified() {
    let dir = TempDir::new().unwrap();
    let data = test_image();
    let sim = SimDevice::new(DeviceType::Xdot);
    let sleeper = RecordingSleeper::new();
    let mut orch = orchestrator(write_image(&dir, &data), &sim, &sleeper);

    let mut progress = Recorder::default();
    let report = orch.run(&mut progress).unwrap();

    assert_eq!(report.state, TransactionState::Succeeded);
    assert_eq!(orch.state(), TransactionState::Succeeded);
    assert_eq!(report.image_size, 4500);
    assert_eq!(report.image_checksum, crc32(&data));
    assert_eq!(report.block_count, 5);
    assert_eq!(report.block_attempts, vec![1; 5]);
    assert_eq!(report.handshake_attempts, 1);
    assert_eq!(report.transfer_passes, 1);

    assert_eq!(
        progress.states,
        vec![
            TransactionState::Connecting,
            TransactionState::EnteringBootloader,
            TransactionState::Transferring,
            TransactionState::Verifying,
            TransactionState::Succeeded,
        ]
    );
    assert_eq!(progress.bytes, vec![1024, 2048, 3072, 4096, 4500]);
    assert_eq!(progress.finished, Some(TransactionState::Succeeded));

    // Device flash now reads back as the image
    assert_eq!(sim.flash(data.len()), data);
    assert_eq!(crc32(&sim.flash(data.len())), report.image_checksum);

    let stats = sim.stats();
    assert_eq!(stats.opens, 1);
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.checksum_requests, 1);
    assert_eq!(stats.leaves, 1);
    assert!(!sim.in_bootloader());
    assert_eq!(sleeper.total(), Duration::ZERO);
}

#[test]
fn tampered_image_never_touches_device() {
    let dir = TempDir::new().unwrap();
    let data = test_image();
    let path = write_image(&dir, &data);
    std::fs::write(
        dir.path().join("app.bin.crc32"),
        format!("{:08x}\n", crc32(&data) ^ 1),
    )
    .unwrap();

    let sim = SimDevice::new(DeviceType::Xdot);
    let sleeper = RecordingSleeper::new();
    let failure = orchestrator(path, &sim, &sleeper)
        .run(&mut NoProgress)
        .unwrap_err();

    assert!(matches!(failure.error, Error::InvalidImage(_)));
    assert_eq!(failure.stage, TransactionState::Idle);
    assert_eq!(failure.report.state, TransactionState::Failed);
    assert_eq!(sim.stats().opens, 0);
}

#[test]
fn oversized_image_is_rejected() {
    let dir = TempDir::new().unwrap();
    let data = vec![0x5A; 256 * 1024 + 1];
    let sim = SimDevice::new(DeviceType::Xdot);
    let failure = orchestrator(write_image(&dir, &data), &sim, &RecordingSleeper::new())
        .run(&mut NoProgress)
        .unwrap_err();

    assert!(matches!(failure.error, Error::InvalidImage(_)));
    assert_eq!(sim.stats().opens, 0);
}

#[test]
fn rejected_block_is_retried_once() {
    let dir = TempDir::new().unwrap();
    let data = test_image();
    let sim = SimDevice::new(DeviceType::Xdot).reject_block(3, 1);
    let sleeper = RecordingSleeper::new();

    let mut progress = Recorder::default();
    let report = orchestrator(write_image(&dir, &data), &sim, &sleeper)
        .run(&mut progress)
        .unwrap();

    assert_eq!(report.state, TransactionState::Succeeded);
    assert_eq!(report.block_attempts, vec![1, 1, 1, 2, 1]);
    assert_eq!(report.block_retries(), 1);
    assert_eq!(progress.retries, vec![("block".to_string(), 1)]);
    assert_eq!(sim.stats().writes_for(3), 2);
    assert_eq!(sim.flash(data.len()), data);
}

#[test]
fn lost_acknowledgment_is_recovered_by_resend() {
    let dir = TempDir::new().unwrap();
    let data = test_image();
    let sim = SimDevice::new(DeviceType::Xdot).drop_ack(1, 1);

    let report = orchestrator(write_image(&dir, &data), &sim, &RecordingSleeper::new())
        .run(&mut NoProgress)
        .unwrap();

    assert_eq!(report.block_attempts, vec![1, 2, 1, 1, 1]);
    assert_eq!(sim.stats().writes_for(1), 2);
    assert_eq!(sim.flash(data.len()), data);
}

#[test]
fn persistent_rejection_fails_transfer() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot).reject_block(2, 10);

    let failure = orchestrator(write_image(&dir, &test_image()), &sim, &RecordingSleeper::new())
        .run(&mut NoProgress)
        .unwrap_err();

    assert_eq!(failure.stage, TransactionState::Transferring);
    match &failure.error {
        Error::TransferFailed {
            block,
            attempts,
            last,
        } => {
            assert_eq!(*block, 2);
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, Error::BlockRejected { index: 2, .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // Blocks after the failing one are never sent
    let stats = sim.stats();
    assert_eq!(stats.writes_for(2), 3);
    assert_eq!(stats.writes_for(3), 0);
    assert_eq!(stats.leaves, 1);
}

#[test]
fn silent_device_is_not_responding_after_backoff() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot).never_answer_handshake();
    let sleeper = RecordingSleeper::new();

    let mut progress = Recorder::default();
    let failure = orchestrator(write_image(&dir, &test_image()), &sim, &sleeper)
        .run(&mut progress)
        .unwrap_err();

    assert_eq!(failure.stage, TransactionState::EnteringBootloader);
    match &failure.error {
        Error::DeviceNotResponding { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, Error::HandshakeTimeout(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(failure.report.handshake_attempts, 3);
    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert_eq!(sleeper.total(), Duration::from_secs(7));

    let stats = sim.stats();
    assert_eq!(stats.handshakes, 3);
    assert_eq!(stats.resets, 3);
    assert!(stats.block_writes.is_empty());
    assert_eq!(progress.finished, Some(TransactionState::Failed));
}

#[test]
fn late_handshake_succeeds_on_retry() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot).ignore_handshakes(1);
    let sleeper = RecordingSleeper::new();

    let report = orchestrator(write_image(&dir, &test_image()), &sim, &sleeper)
        .run(&mut NoProgress)
        .unwrap();

    assert_eq!(report.handshake_attempts, 2);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(1)]);
}

#[test]
fn checksum_mismatch_retransfers_once_then_fails() {
    let dir = TempDir::new().unwrap();
    let data = test_image();
    let sim = SimDevice::new(DeviceType::Xdot).corrupt_checksums(u32::MAX);

    let failure = orchestrator(write_image(&dir, &data), &sim, &RecordingSleeper::new())
        .run(&mut NoProgress)
        .unwrap_err();

    assert_eq!(failure.stage, TransactionState::Verifying);
    match failure.error {
        Error::VerificationMismatch { expected, actual } => {
            assert_eq!(expected, crc32(&data));
            assert_ne!(actual, expected);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(failure.report.transfer_passes, 2);

    let stats = sim.stats();
    assert_eq!(stats.checksum_requests, 2);
    assert_eq!(stats.handshakes, 2);
    assert_eq!(stats.writes_for(0), 2);
    assert_eq!(stats.writes_for(4), 2);
}

#[test]
fn transient_checksum_mismatch_recovers() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot).corrupt_checksums(1);

    let report = orchestrator(write_image(&dir, &test_image()), &sim, &RecordingSleeper::new())
        .run(&mut NoProgress)
        .unwrap();

    assert_eq!(report.state, TransactionState::Succeeded);
    assert_eq!(report.transfer_passes, 2);
    assert_eq!(sim.stats().checksum_requests, 2);
}

#[test]
fn wrong_acknowledgment_index_fails() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot).skip_ack_index();

    let failure = orchestrator(write_image(&dir, &test_image()), &sim, &RecordingSleeper::new())
        .run(&mut NoProgress)
        .unwrap_err();

    assert_eq!(failure.stage, TransactionState::Transferring);
    assert!(matches!(
        failure.error,
        Error::TransferFailed { block: 0, .. }
    ));
}

#[test]
fn repeated_runs_are_independent() {
    let dir = TempDir::new().unwrap();
    let data = test_image();
    let sim = SimDevice::new(DeviceType::Xdot);
    let mut orch = orchestrator(write_image(&dir, &data), &sim, &RecordingSleeper::new());

    let first = orch.run(&mut NoProgress).unwrap();
    let second = orch.run(&mut NoProgress).unwrap();

    assert_eq!(first.state, second.state);
    assert_eq!(first.block_attempts, second.block_attempts);
    assert_eq!(first.handshake_attempts, second.handshake_attempts);
    assert_eq!(first.transfer_passes, second.transfer_passes);
    assert_eq!(sim.flash(data.len()), data);
    assert_eq!(sim.stats().opens, 2);
}

#[test]
fn absent_port_is_retried_then_not_responding() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot).absent();
    let sleeper = RecordingSleeper::new();

    let failure = orchestrator(write_image(&dir, &test_image()), &sim, &sleeper)
        .run(&mut NoProgress)
        .unwrap_err();

    assert_eq!(failure.stage, TransactionState::Connecting);
    match &failure.error {
        Error::DeviceNotResponding { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, Error::DeviceNotFound(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(sleeper.total(), Duration::from_secs(7));
    assert_eq!(sim.stats().opens, 0);
}

/// Port that is missing for the first `missing` opens, as while the USB
/// interface re-enumerates
struct Reenumerating {
    sim: SimDevice,
    missing: Cell<u32>,
}

impl Connector for Reenumerating {
    type Transport = SimTransport;

    fn open(&self, port: &str, settings: &LinkSettings) -> Result<SimTransport> {
        if self.missing.get() > 0 {
            self.missing.set(self.missing.get() - 1);
            return Err(Error::DeviceNotFound(format!("{}: re-enumerating", port)));
        }
        self.sim.open(port, settings)
    }
}

#[test]
fn port_reappearing_after_reset_is_opened_on_retry() {
    let dir = TempDir::new().unwrap();
    let data = test_image();
    let sim = SimDevice::new(DeviceType::Xdot);
    let sleeper = RecordingSleeper::new();
    let connector = Reenumerating {
        sim: sim.clone(),
        missing: Cell::new(1),
    };
    let config = FlashConfig::new(write_image(&dir, &data), PORT, DeviceType::Xdot);

    let mut progress = Recorder::default();
    let report = FlashOrchestrator::new(config, connector, PortLocks::new())
        .with_sleeper(sleeper.clone())
        .run(&mut progress)
        .unwrap();

    assert_eq!(report.state, TransactionState::Succeeded);
    assert_eq!(report.handshake_attempts, 2);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(1)]);
    assert_eq!(progress.retries, vec![("bootloader entry".to_string(), 1)]);
    assert_eq!(progress.states[0], TransactionState::Connecting);
    assert_eq!(sim.stats().opens, 1);
    assert_eq!(sim.stats().handshakes, 1);
    assert_eq!(sim.flash(data.len()), data);
}

#[test]
fn failed_reconnect_on_repass_leaves_bootloader() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot).corrupt_checksums(1);
    let token = CancelToken::new();
    let mut orch = orchestrator(write_image(&dir, &test_image()), &sim, &RecordingSleeper::new())
        .with_cancel_token(token.clone());

    let mut progress = Recorder {
        cancel_on_repass: Some(token),
        ..Default::default()
    };
    let failure = orch.run(&mut progress).unwrap_err();

    assert!(matches!(failure.error, Error::Cancelled));
    assert_eq!(failure.report.transfer_passes, 2);
    let stats = sim.stats();
    assert_eq!(stats.handshakes, 1);
    assert_eq!(stats.checksum_requests, 1);
    assert_eq!(stats.leaves, 1);
    assert!(!sim.in_bootloader());
}

#[test]
fn held_port_is_busy() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot);
    let locks = PortLocks::new();
    let config = FlashConfig::new(write_image(&dir, &test_image()), PORT, DeviceType::Xdot);
    let mut orch = FlashOrchestrator::new(config, sim.clone(), locks.clone())
        .with_sleeper(RecordingSleeper::new());

    let lease = locks.acquire(PORT).unwrap();
    let failure = orch.run(&mut NoProgress).unwrap_err();
    assert!(matches!(failure.error, Error::DeviceBusy(_)));
    assert_eq!(sim.stats().opens, 0);

    // Released once the holder goes away
    drop(lease);
    assert!(orch.run(&mut NoProgress).is_ok());
    assert!(!locks.is_held(PORT));
}

#[test]
fn cancellation_stops_between_blocks() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot);
    let token = CancelToken::new();
    let mut orch = orchestrator(write_image(&dir, &test_image()), &sim, &RecordingSleeper::new())
        .with_cancel_token(token.clone());

    let mut progress = Recorder {
        cancel_after: Some((2, token)),
        ..Default::default()
    };
    let failure = orch.run(&mut progress).unwrap_err();

    assert!(matches!(failure.error, Error::Cancelled));
    assert_eq!(failure.stage, TransactionState::Transferring);
    let stats = sim.stats();
    assert_eq!(stats.writes_for(1), 1);
    assert_eq!(stats.writes_for(2), 0);
    assert_eq!(stats.leaves, 1);
}

#[test]
fn cancellation_before_start_opens_nothing() {
    let dir = TempDir::new().unwrap();
    let sim = SimDevice::new(DeviceType::Xdot);
    let token = CancelToken::new();
    token.cancel();

    let failure = orchestrator(write_image(&dir, &test_image()), &sim, &RecordingSleeper::new())
        .with_cancel_token(token)
        .run(&mut NoProgress)
        .unwrap_err();

    assert!(matches!(failure.error, Error::Cancelled));
    assert_eq!(sim.stats().opens, 0);
}

#[test]
fn mdot_uses_its_own_block_size() {
    let dir = TempDir::new().unwrap();
    let data = vec![0x11; 5000];
    let sim = SimDevice::new(DeviceType::Mdot);
    let config = FlashConfig::new(write_image(&dir, &data), PORT, DeviceType::Mdot);

    let report = FlashOrchestrator::new(config, sim.clone(), PortLocks::new())
        .with_sleeper(RecordingSleeper::new())
        .run(&mut NoProgress)
        .unwrap();

    assert_eq!(report.block_count, 3);
    assert_eq!(sim.flash(data.len()), data);
}
