//! Logger initialization
//!
//! The library only emits through the `log` facade. The binary picks the
//! backend: `env_logger` on stderr, or the macOS Unified Logging System.

use anyhow::Result;
use log::LevelFilter;

use crate::constants::APP_SUBSYSTEM;

/// Map `-v` occurrences to a level filter
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install the global logger. `RUST_LOG` still overrides the stderr level.
pub fn init_logger(verbosity: u8, unified_logging: bool) -> Result<()> {
    let level = level_for_verbosity(verbosity);

    if unified_logging {
        return init_unified_logging(level);
    }

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

#[cfg(target_os = "macos")]
fn init_unified_logging(level: LevelFilter) -> Result<()> {
    oslog::OsLogger::new(APP_SUBSYSTEM)
        .level_filter(level)
        .init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

#[cfg(not(target_os = "macos"))]
fn init_unified_logging(_level: LevelFilter) -> Result<()> {
    Err(anyhow::anyhow!(
        "Unified Logging ({}) is only available on macOS",
        APP_SUBSYSTEM
    ))
}
