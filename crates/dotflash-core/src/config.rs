//! Transaction configuration
//!
//! A [`FlashConfig`] is built from the device profile defaults, then
//! optionally overridden by a TOML file and finally by command line flags.
//!
//! ```toml
//! [link]
//! baud = 115200
//! timeout_ms = 1000
//!
//! [handshake]
//! timeout_ms = 5000
//! max_attempts = 3
//! backoff_ms = [1000, 2000, 4000]
//!
//! [transfer]
//! block_size = "1 KiB"
//! ack_timeout_ms = 2000
//! max_block_attempts = 3
//! verify_timeout_ms = 10000
//! verify_retries = 1
//!
//! [commands]
//! enter = "BOOT"
//! ready = "READY"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::{BootloaderCommands, DeviceType};
use crate::error::{Error, Result};

/// Largest block the line framing accepts
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Serial link parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Default timeout for a single blocking read or write
    pub timeout: Duration,
}

/// Bounded retry policy with a backoff schedule
///
/// The delay after failed attempt `n` (1-based) is `backoff[n - 1]`, or the
/// last entry once the schedule is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delays applied after each failed attempt
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    /// Policy with no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Vec::new(),
        }
    }

    /// Exponential backoff: `base`, `2 * base`, `4 * base`, ...
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        let backoff = (0..max_attempts)
            .map(|i| base.saturating_mul(1u32 << i.min(16)))
            .collect();
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff.is_empty() || attempt == 0 {
            return Duration::ZERO;
        }
        let idx = (attempt as usize - 1).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

/// Timeouts of the bootloader exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimeouts {
    /// Wait for the ready line after the enter command
    pub handshake: Duration,
    /// Wait for a block acknowledgment
    pub ack: Duration,
    /// Wait for the device-side checksum
    pub verify: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(5),
            ack: Duration::from_secs(2),
            verify: Duration::from_secs(10),
        }
    }
}

/// Everything one flash transaction needs
#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// Firmware image to flash
    pub image: PathBuf,
    /// Expected image checksum, if given by the caller
    pub expected_checksum: Option<u32>,
    /// Communication port (e.g. `/dev/ttyACM0`)
    pub port: String,
    /// Target module type
    pub device: DeviceType,
    /// Serial link parameters
    pub link: LinkSettings,
    /// Transfer block size in bytes
    pub block_size: usize,
    /// Bootloader exchange timeouts
    pub timeouts: ProtocolTimeouts,
    /// Reset + bootloader entry attempts
    pub handshake_retry: RetryPolicy,
    /// Attempts per block
    pub block_retry: RetryPolicy,
    /// Full re-transfers allowed after a verification mismatch
    pub verify_retries: u32,
    /// Bootloader command words
    pub commands: BootloaderCommands,
}

impl FlashConfig {
    /// Configuration with the defaults of the device profile
    pub fn new(image: impl Into<PathBuf>, port: impl Into<String>, device: DeviceType) -> Self {
        let profile = device.profile();
        Self {
            image: image.into(),
            expected_checksum: None,
            port: port.into(),
            device,
            link: LinkSettings {
                baud_rate: profile.default_baud,
                timeout: Duration::from_secs(1),
            },
            block_size: profile.default_block_size,
            timeouts: ProtocolTimeouts::default(),
            handshake_retry: RetryPolicy::exponential(3, Duration::from_secs(1)),
            block_retry: RetryPolicy::immediate(3),
            verify_retries: 1,
            commands: profile.commands(),
        }
    }

    /// Flash capacity of the target
    pub fn capacity(&self) -> u32 {
        self.device.profile().flash_capacity
    }

    /// Check the configuration for values no transaction can run with
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(Error::Config("no port specified".into()));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "block size {} out of range (1..={})",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.link.baud_rate == 0 {
            return Err(Error::Config("baud rate must be non-zero".into()));
        }
        if self.handshake_retry.max_attempts == 0 || self.block_retry.max_attempts == 0 {
            return Err(Error::Config("retry policies need at least one attempt".into()));
        }
        let commands = [
            &self.commands.enter,
            &self.commands.ready,
            &self.commands.write,
            &self.commands.checksum,
            &self.commands.leave,
        ];
        if commands
            .iter()
            .any(|c| c.is_empty() || c.contains(|ch: char| ch == '\r' || ch == '\n'))
        {
            return Err(Error::Config(
                "bootloader commands must be non-empty single-line words".into(),
            ));
        }
        Ok(())
    }

    /// Apply the settings present in a config file
    pub fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(link) = &file.link {
            if let Some(baud) = link.baud {
                self.link.baud_rate = baud;
            }
            if let Some(ms) = link.timeout_ms {
                self.link.timeout = Duration::from_millis(ms);
            }
        }

        if let Some(hs) = &file.handshake {
            if let Some(ms) = hs.timeout_ms {
                self.timeouts.handshake = Duration::from_millis(ms);
            }
            if let Some(n) = hs.max_attempts {
                self.handshake_retry.max_attempts = n;
            }
            if let Some(backoff) = &hs.backoff_ms {
                self.handshake_retry.backoff =
                    backoff.iter().map(|&ms| Duration::from_millis(ms)).collect();
            }
        }

        if let Some(tr) = &file.transfer {
            if let Some(size) = tr.block_size {
                self.block_size = size as usize;
            }
            if let Some(ms) = tr.ack_timeout_ms {
                self.timeouts.ack = Duration::from_millis(ms);
            }
            if let Some(n) = tr.max_block_attempts {
                self.block_retry.max_attempts = n;
            }
            if let Some(ms) = tr.verify_timeout_ms {
                self.timeouts.verify = Duration::from_millis(ms);
            }
            if let Some(n) = tr.verify_retries {
                self.verify_retries = n;
            }
        }

        if let Some(cmds) = &file.commands {
            let targets = [
                (&cmds.enter, &mut self.commands.enter),
                (&cmds.ready, &mut self.commands.ready),
                (&cmds.write, &mut self.commands.write),
                (&cmds.checksum, &mut self.commands.checksum),
                (&cmds.leave, &mut self.commands.leave),
            ];
            for (value, target) in targets {
                if let Some(value) = value {
                    *target = value.clone();
                }
            }
        }
    }
}

/// Optional overrides loaded from a TOML file
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    link: Option<LinkSection>,
    handshake: Option<HandshakeSection>,
    transfer: Option<TransferSection>,
    commands: Option<CommandsSection>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkSection {
    baud: Option<u32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct HandshakeSection {
    timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    backoff_ms: Option<Vec<u64>>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TransferSection {
    #[serde(default, deserialize_with = "deserialize_size")]
    block_size: Option<u32>,
    ack_timeout_ms: Option<u64>,
    max_block_attempts: Option<u32>,
    verify_timeout_ms: Option<u64>,
    verify_retries: Option<u32>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandsSection {
    enter: Option<String>,
    ready: Option<String>,
    write: Option<String>,
    checksum: Option<String>,
    leave: Option<String>,
}

impl ConfigFile {
    /// Load overrides from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse overrides from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Deserialize a size that can be an integer, hex string or "4 KiB"
fn deserialize_size<'de, D>(deserializer: D) -> core::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeOrInt {
        Int(u32),
        Str(String),
    }

    match Option::<SizeOrInt>::deserialize(deserializer)? {
        None => Ok(None),
        Some(SizeOrInt::Int(n)) => Ok(Some(n)),
        Some(SizeOrInt::Str(s)) => parse_size(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse a size string like "1 KiB", "0x400" or "1024"
pub fn parse_size(s: &str) -> core::result::Result<u32, String> {
    let s = s.trim();

    if let Ok(n) = s.parse::<u32>() {
        return Ok(n);
    }

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex.trim(), 16).map_err(|e| format!("invalid hex: {}", e));
    }

    let lower = s.to_lowercase();
    let (num_str, multiplier) = if let Some(n) = lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n.trim(), 1024)
    } else if let Some(n) = lower.strip_suffix("b") {
        (n.trim(), 1)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let num: u32 = num_str.parse().map_err(|_| format!("invalid size: {}", s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_profile() {
        let config = FlashConfig::new("fw.bin", "/dev/ttyACM0", DeviceType::Mdot);
        assert_eq!(config.link.baud_rate, 115_200);
        assert_eq!(config.block_size, 2048);
        assert_eq!(config.capacity(), 512 * 1024);
        assert_eq!(config.handshake_retry.max_attempts, 3);
        assert_eq!(config.block_retry.max_attempts, 3);
        assert_eq!(config.verify_retries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        // Schedule exhausted: keep the last delay
        assert_eq!(policy.delay_after(7), Duration::from_secs(4));

        let total: Duration = (1..=3).map(|a| policy.delay_after(a)).sum();
        assert_eq!(total, Duration::from_secs(7));

        assert_eq!(RetryPolicy::immediate(3).delay_after(2), Duration::ZERO);
    }

    #[test]
    fn test_validate() {
        let mut config = FlashConfig::new("fw.bin", "", DeviceType::Xdot);
        assert!(config.validate().is_err());

        config.port = "/dev/ttyACM0".into();
        config.block_size = 0;
        assert!(config.validate().is_err());

        config.block_size = 512;
        config.block_retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.block_retry.max_attempts = 1;
        config.commands.ready = "READY\n".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_file() {
        let file = ConfigFile::from_toml_str(
            r#"
            [link]
            baud = 9600

            [handshake]
            timeout_ms = 2500
            backoff_ms = [10, 20]

            [transfer]
            block_size = "4 KiB"
            max_block_attempts = 5
            verify_retries = 0

            [commands]
            ready = "BL>"
            "#,
        )
        .unwrap();

        let mut config = FlashConfig::new("fw.bin", "/dev/ttyACM0", DeviceType::Xdot);
        config.apply_file(&file);

        assert_eq!(config.link.baud_rate, 9600);
        assert_eq!(config.timeouts.handshake, Duration::from_millis(2500));
        assert_eq!(config.handshake_retry.max_attempts, 3);
        assert_eq!(config.handshake_retry.delay_after(2), Duration::from_millis(20));
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.block_retry.max_attempts, 5);
        assert_eq!(config.verify_retries, 0);
        assert_eq!(config.commands.ready, "BL>");
        assert_eq!(config.commands.enter, "BOOT");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(ConfigFile::from_toml_str("[link]\nbaudrate = 1\n").is_err());
        assert!(ConfigFile::from_toml_str("").is_ok());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Ok(1024));
        assert_eq!(parse_size("0x400"), Ok(1024));
        assert_eq!(parse_size("2 KiB"), Ok(2048));
        assert_eq!(parse_size("2kb"), Ok(2048));
        assert_eq!(parse_size("512 B"), Ok(512));
        assert!(parse_size("lots").is_err());
    }
}
