//! TEAM_517: Driver tunables.
//!
//! Defaults match the hardware bring-up values. Overrides arrive as a
//! kernel-style command line (`mali.job_timeout_ms=4000 mali.preemption=0`)
//! so a board file can adjust them without rebuilding.

use std::time::Duration;

use log::{LevelFilter, warn};
use mali_error::define_kernel_error;

define_kernel_error! {
    pub enum ConfigError(0x08, "config") {
        /// A recognised key carried a value that does not parse
        InvalidValue = 0x01 => "Invalid configuration value",
        /// An entry without `=`
        MalformedEntry = 0x02 => "Malformed configuration entry",
    }
}

const KEY_PREFIX: &str = "mali.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// How long the device thread may stall waiting for a free address slot.
    pub acquire_slot_timeout: Duration,
    /// Hardware atom execution budget before it is soft-stopped.
    pub job_timeout: Duration,
    /// Budget for a soft atom waiting on a semaphore.
    pub semaphore_timeout: Duration,
    /// Time a soft-stopped atom gets to yield before it is hard-stopped, and
    /// a hard-stopped one gets to be reported before the GPU is reset.
    pub hard_stop_grace: Duration,
    /// Soft-stop lower priority work when higher priority work is runnable.
    pub preemption_enabled: bool,
    /// Fallback when `AS_PRESENT` reads zero.
    pub address_slot_count: u32,
    /// Fallback when `JS_PRESENT` reads zero.
    pub job_slot_count: u32,
    pub cache_coherent: bool,
    pub log_level: LevelFilter,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            acquire_slot_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_millis(2000),
            semaphore_timeout: Duration::from_millis(5000),
            hard_stop_grace: Duration::from_millis(100),
            preemption_enabled: true,
            address_slot_count: 8,
            job_slot_count: 3,
            cache_coherent: false,
            log_level: LevelFilter::Info,
        }
    }
}

impl DriverConfig {
    /// Apply `mali.<key>=<value>` overrides on top of the defaults.
    ///
    /// Entries without the `mali.` prefix belong to other drivers and are
    /// skipped silently. Unknown `mali.` keys are warned about and ignored.
    pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for entry in cmdline.split_whitespace() {
            let Some(entry) = entry.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            let (key, value) = entry.split_once('=').ok_or(ConfigError::MalformedEntry)?;
            config.apply(key, value)?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "slot_timeout_ms" => self.acquire_slot_timeout = parse_millis(value)?,
            "job_timeout_ms" => self.job_timeout = parse_millis(value)?,
            "semaphore_timeout_ms" => self.semaphore_timeout = parse_millis(value)?,
            "hard_stop_grace_ms" => self.hard_stop_grace = parse_millis(value)?,
            "preemption" => self.preemption_enabled = parse_bool(value)?,
            "address_slots" => self.address_slot_count = parse_count(value)?,
            "job_slots" => self.job_slot_count = parse_count(value)?,
            "cache_coherent" => self.cache_coherent = parse_bool(value)?,
            "log" => {
                self.log_level = value.parse().map_err(|_| ConfigError::InvalidValue)?;
            }
            _ => warn!("config: ignoring unknown key mali.{key}"),
        }
        Ok(())
    }
}

fn parse_millis(value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidValue)
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue),
    }
}

fn parse_count(value: &str) -> Result<u32, ConfigError> {
    // Register masks are 16 bits wide.
    match value.parse::<u32>() {
        Ok(count) if (1..=16).contains(&count) => Ok(count),
        _ => Err(ConfigError::InvalidValue),
    }
}
