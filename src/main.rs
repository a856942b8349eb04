//! flashit - Firmware flasher for Multitech xDot and mDot modules
//!
//! Loads a firmware image, resets the module into its bootloader over the
//! USB serial interface, streams the image block by block and verifies the
//! device checksum before starting the new application.
//!
//! `--port sim:[fault]` runs the same transaction against the in-memory
//! simulated bootloader instead of a serial port.

mod cli;
mod exit;
mod progress;

use clap::Parser;
use cli::Cli;
use dotflash_core::{
    CancelToken, ConfigFile, Connector, FlashConfig, FlashFailure, FlashOrchestrator, FlashReport,
    PortLocks,
};
use dotflash_serial::SerialConnector;
use dotflash_sim::SimDevice;
use progress::IndicatifProgress;

/// Port prefix selecting the simulated device
const SIM_PORT_PREFIX: &str = "sim:";

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(exit::code_for(e.as_ref()));
    }
    std::process::exit(exit::SUCCESS);
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.list_ports {
        return list_ports();
    }

    let config = build_config(cli)?;

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        handler.cancel();
        log::warn!("Interrupted, stopping after the current block");
    })?;

    let mut progress = IndicatifProgress::new();
    let report = match config.port.strip_prefix(SIM_PORT_PREFIX) {
        Some(fault) => {
            let sim = SimDevice::from_fault(config.device, fault)?;
            flash(config, sim, cancel, &mut progress)?
        }
        None => flash(config, SerialConnector::new(), cancel, &mut progress)?,
    };

    print_summary(&report);
    Ok(())
}

fn flash<C: Connector>(
    config: FlashConfig,
    connector: C,
    cancel: CancelToken,
    progress: &mut IndicatifProgress,
) -> Result<FlashReport, FlashFailure> {
    FlashOrchestrator::new(config, connector, PortLocks::new())
        .with_cancel_token(cancel)
        .run(progress)
}

/// Build the transaction configuration: profile defaults, then the config
/// file, then command line flags
fn build_config(cli: &Cli) -> Result<FlashConfig, Box<dyn std::error::Error>> {
    let (Some(image), Some(port), Some(device)) = (&cli.image, &cli.port, cli.device) else {
        return Err("--image, --port and --type are required".into());
    };

    let mut config = FlashConfig::new(image.clone(), port.clone(), device.into());

    if let Some(path) = &cli.config {
        let file = ConfigFile::from_toml_file(path)?;
        config.apply_file(&file);
        log::debug!("Applied settings from {}", path.display());
    }

    if let Some(baud) = cli.baud {
        config.link.baud_rate = baud;
    }
    if let Some(size) = cli.block_size {
        config.block_size = size as usize;
    }
    if cli.crc32.is_some() {
        config.expected_checksum = cli.crc32;
    }

    Ok(config)
}

fn print_summary(report: &FlashReport) {
    println!(
        "Flashed {} bytes ({} blocks, CRC32 0x{:08X}) to {} on {} in {:.1}s",
        report.image_size,
        report.block_count,
        report.image_checksum,
        report.device,
        report.port,
        report.elapsed.as_secs_f32()
    );
    let retries = report.block_retries();
    if retries > 0 || report.handshake_attempts > 1 || report.transfer_passes > 1 {
        println!(
            "  {} bootloader entry attempts, {} block retries, {} transfer passes",
            report.handshake_attempts, retries, report.transfer_passes
        );
    }
}

fn list_ports() -> Result<(), Box<dyn std::error::Error>> {
    let ports = dotflash_serial::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    println!("Serial ports:");
    println!();
    for port in ports {
        let usb = match port.usb_id {
            Some((vid, pid)) => format!("{:04x}:{:04x}", vid, pid),
            None => "-".to_string(),
        };
        let marker = if port.is_likely_dot() { "  (Dot interface)" } else { "" };
        println!(
            "  {:<20} {:<10} {}{}",
            port.name,
            usb,
            port.product.as_deref().unwrap_or(""),
            marker
        );
    }
    Ok(())
}
