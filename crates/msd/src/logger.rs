//! TEAM_221: Driver logger implementation.
//!
//! Implements the `log::Log` trait to route log messages to stderr with a
//! level prefix. Messages from other crates are dropped below `Warn` so the
//! driver's own trace output stays readable.

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

/// Global logger instance
static LOGGER: DriverLogger = DriverLogger;

const OWN_TARGET: &str = "mali_";

struct DriverLogger;

/// Own messages up to `max_level`; other crates only at `Warn` and above.
fn passes(metadata: &Metadata, max_level: LevelFilter) -> bool {
    if metadata.level() > max_level {
        return false;
    }
    metadata.target().starts_with(OWN_TARGET) || metadata.level() <= Level::Warn
}

impl log::Log for DriverLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        passes(metadata, log::max_level())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Strip the crate prefix: "mali_msd::job_scheduler" -> "job_scheduler"
        let target = record.target();
        let short = target.rsplit("::").next().unwrap_or(target);
        eprintln!("[{:<5} {short}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Initialize the logger. Fails if a logger is already installed, in which
/// case the installed one and its level are left alone.
///
/// # Arguments
/// * `max_level` - The maximum log level to display.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}
