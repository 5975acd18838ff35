//! Driver configuration.
//!
//! Defaults match the timing the 6205 firmware was qualified against.
//! Each knob can be overridden from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `HPI_TIMEOUT_POLLS` | [`HifConfig::timeout_polls`] |
//! | `HPI_START_TIMEOUT_POLLS` | [`BootConfig::start_timeout_polls`] |
//! | `HPI_ACK_RETRIES` | [`BootConfig::reset_ack_retries`] |
//! | `HPI_VERIFY_POLICY` | [`BootConfig::verify`] (`fatal` or `log`) |
//! | `HPI_BULK_FAILURES_BEFORE_CRASH` | [`DriverConfig::bulk_failures_before_crash`] |
//! | `HPI_DSPCODE_DIR` | [`DriverConfig::dspcode_dir`] |

use hpi_chip::hif;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, warn};

/// What to do when a loaded word does not read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPolicy {
    /// Fail the boot with a code verification fault.
    #[default]
    Fatal,
    /// Log the first mismatch of each image and carry on.
    LogOnly,
}

impl FromStr for VerifyPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(Self::Fatal),
            "log" | "log-only" | "logonly" => Ok(Self::LogOnly),
            other => Err(format!("unknown verify policy {other:?} (expected fatal or log)")),
        }
    }
}

/// HIF transport timing.
#[derive(Debug, Clone)]
pub struct HifConfig {
    /// Poll budget for the idle, ack and response waits.
    pub timeout_polls: u32,
    /// Delay between idle polls (µs).
    pub idle_delay_us: u32,
    /// Delay between bulk chunk interrupt polls (µs).
    pub bulk_delay_us: u32,
    /// Bytes moved per bulk chunk.
    pub bulk_chunk: usize,
}

impl Default for HifConfig {
    fn default() -> Self {
        Self {
            timeout_polls: hif::TIMEOUT_POLLS,
            idle_delay_us: hif::IDLE_POLL_DELAY_US,
            bulk_delay_us: hif::BULK_POLL_DELAY_US,
            bulk_chunk: hif::DATA_SIZE,
        }
    }
}

/// Bootloader timing and policy.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Settle time after warm reset and between C6713 PLL steps (µs).
    pub reset_delay_us: u32,
    /// Settle time around the secondary DSP reset release (µs).
    pub release_delay_us: u32,
    /// Delay after ringing the start doorbell (µs).
    pub start_delay_us: u32,
    /// Poll budget for the first interrupt after start.
    pub start_timeout_polls: u32,
    /// Polls of the ack word for the reset acknowledgement.
    pub reset_ack_retries: u32,
    /// Delay between reset acknowledgement polls (µs).
    pub reset_ack_delay_us: u32,
    /// Mailbox publish attempts.
    pub mailbox_retries: u32,
    /// Words tested per memory region.
    pub memory_test_words: u32,
    /// Verification mismatch policy.
    pub verify: VerifyPolicy,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            reset_delay_us: 1000,
            release_delay_us: 100,
            start_delay_us: 10_000,
            start_timeout_polls: hif::TIMEOUT_POLLS * hif::START_TIMEOUT_FACTOR,
            reset_ack_retries: hif::RESET_ACK_RETRIES,
            reset_ack_delay_us: hif::RESET_ACK_DELAY_US,
            mailbox_retries: hif::MAILBOX_RETRIES,
            memory_test_words: 1000,
            verify: VerifyPolicy::Fatal,
        }
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Transport timing.
    pub hif: HifConfig,
    /// Boot timing and policy.
    pub boot: BootConfig,
    /// Consecutive bulk transfer failures that mark an adapter crashed.
    pub bulk_failures_before_crash: u32,
    /// Directory holding `dsp<family>.bin` images.
    pub dspcode_dir: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            hif: HifConfig::default(),
            boot: BootConfig::default(),
            bulk_failures_before_crash: 3,
            dspcode_dir: None,
        }
    }
}

impl DriverConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, ignoring unparsable values.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        override_from(&lookup, "HPI_TIMEOUT_POLLS", &mut self.hif.timeout_polls);
        override_from(&lookup, "HPI_START_TIMEOUT_POLLS", &mut self.boot.start_timeout_polls);
        override_from(&lookup, "HPI_ACK_RETRIES", &mut self.boot.reset_ack_retries);
        override_from(&lookup, "HPI_VERIFY_POLICY", &mut self.boot.verify);
        override_from(
            &lookup,
            "HPI_BULK_FAILURES_BEFORE_CRASH",
            &mut self.bulk_failures_before_crash,
        );
        if let Some(dir) = lookup("HPI_DSPCODE_DIR") {
            debug!("HPI_DSPCODE_DIR = {dir}");
            self.dspcode_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Budgets sized for the software double: small poll counts so that
    /// timeouts surface in milliseconds, and no settle delays.
    #[must_use]
    pub fn for_simulation() -> Self {
        Self {
            hif: HifConfig {
                timeout_polls: 2_000,
                ..HifConfig::default()
            },
            boot: BootConfig {
                start_timeout_polls: 2_000,
                reset_ack_retries: 10,
                ..BootConfig::default()
            },
            ..Self::default()
        }
    }
}

fn override_from<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr + std::fmt::Debug,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            debug!("{key} = {value:?}");
            *slot = value;
        }
        Err(e) => warn!("Ignoring {key}={raw:?}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_firmware_timing() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.hif.timeout_polls, 1_000_000);
        assert_eq!(cfg.boot.start_timeout_polls, 10_000_000);
        assert_eq!(cfg.boot.reset_ack_retries, 100);
        assert_eq!(cfg.boot.mailbox_retries, 10);
        assert_eq!(cfg.hif.bulk_delay_us, 20);
        assert_eq!(cfg.hif.bulk_chunk, 16_384);
        assert_eq!(cfg.boot.verify, VerifyPolicy::Fatal);
        assert_eq!(cfg.bulk_failures_before_crash, 3);
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = DriverConfig::default().with_overrides(lookup(&[
            ("HPI_TIMEOUT_POLLS", "500"),
            ("HPI_VERIFY_POLICY", "log"),
            ("HPI_BULK_FAILURES_BEFORE_CRASH", " 1 "),
            ("HPI_DSPCODE_DIR", "/lib/firmware/asihpi"),
        ]));
        assert_eq!(cfg.hif.timeout_polls, 500);
        assert_eq!(cfg.boot.verify, VerifyPolicy::LogOnly);
        assert_eq!(cfg.bulk_failures_before_crash, 1);
        assert_eq!(cfg.dspcode_dir, Some(PathBuf::from("/lib/firmware/asihpi")));
    }

    #[test]
    fn bad_override_keeps_default() {
        let cfg = DriverConfig::default().with_overrides(lookup(&[
            ("HPI_ACK_RETRIES", "lots"),
            ("HPI_VERIFY_POLICY", "maybe"),
        ]));
        assert_eq!(cfg.boot.reset_ack_retries, 100);
        assert_eq!(cfg.boot.verify, VerifyPolicy::Fatal);
    }
}
