//! Configuration for opening output devices
//!
//! Loaded from a JSON file so strategy selection and queue sizing can be
//! changed without recompiling. Missing or malformed files fall back to the
//! defaults with a warning.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audio::callback::Strategy;
use crate::hardware::tap::DEFAULT_TAP_PERIODS;
use crate::hardware::HostCapabilities;

/// Channel command queue length requested from the host.
pub const DEFAULT_COMMAND_QUEUE_LEN: usize = 128;

/// Which completion protocol to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPreference {
    /// Native double buffering when the host has it, resubmission otherwise.
    #[default]
    Auto,
    Resubmit,
    DoubleBuffer,
}

impl StrategyPreference {
    /// Pick a strategy the host supports, or `None` if it supports neither
    /// the preferred one nor (for `Auto`) any.
    pub fn select(self, capabilities: &HostCapabilities) -> Option<Strategy> {
        match self {
            StrategyPreference::Auto => {
                if capabilities.supports_double_buffer() {
                    Some(Strategy::DoubleBuffer)
                } else if capabilities.supports_resubmit() {
                    Some(Strategy::Resubmit)
                } else {
                    None
                }
            }
            StrategyPreference::Resubmit => capabilities
                .supports_resubmit()
                .then_some(Strategy::Resubmit),
            StrategyPreference::DoubleBuffer => capabilities
                .supports_double_buffer()
                .then_some(Strategy::DoubleBuffer),
        }
    }
}

impl std::str::FromStr for StrategyPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(StrategyPreference::Auto),
            "resubmit" => Ok(StrategyPreference::Resubmit),
            "double_buffer" => Ok(StrategyPreference::DoubleBuffer),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Verbosity for [`init_logging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Settings applied when an output device is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub strategy: StrategyPreference,
    /// Length of the channel command queue
    pub command_queue_len: usize,
    /// Mix the first buffer(s) before playback starts instead of starting
    /// on silence
    pub prime_buffers: bool,
    pub log_level: LogLevel,
    /// Periods the simulated host's playback tap holds
    pub playback_tap_periods: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyPreference::Auto,
            command_queue_len: DEFAULT_COMMAND_QUEUE_LEN,
            prime_buffers: true,
            log_level: LogLevel::Info,
            playback_tap_periods: DEFAULT_TAP_PERIODS,
        }
    }
}

impl OutputConfig {
    /// Load configuration from JSON file
    ///
    /// # Arguments
    /// * `path` - Path to JSON config file
    ///
    /// # Returns
    /// The parsed configuration, or the defaults if the file is missing or
    /// invalid.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        }
    }
}

/// Install a tracing subscriber on stderr that also receives `log` records.
///
/// Returns false if a subscriber was already installed.
pub fn init_logging(level: LogLevel) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(double: bool, resubmit: bool) -> HostCapabilities {
        HostCapabilities {
            manager_major: 3,
            play_double_buffer: double,
            has_asc: false,
            callback_commands: resubmit,
        }
    }

    #[test]
    fn test_default_config() {
        let config = OutputConfig::default();
        assert_eq!(config.strategy, StrategyPreference::Auto);
        assert_eq!(config.command_queue_len, 128);
        assert!(config.prime_buffers);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.playback_tap_periods, 16);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let parsed: OutputConfig =
            serde_json::from_str(r#"{"strategy": "double_buffer", "prime_buffers": false}"#)
                .unwrap();
        assert_eq!(parsed.strategy, StrategyPreference::DoubleBuffer);
        assert!(!parsed.prime_buffers);
        assert_eq!(parsed.command_queue_len, DEFAULT_COMMAND_QUEUE_LEN);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = OutputConfig::load_from_file("/nonexistent/dbuf_output.json");
        assert_eq!(config, OutputConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("dbuf_config_{}.json", std::process::id()));
        fs::write(&path, r#"{"command_queue_len": 8, "log_level": "debug"}"#).unwrap();

        let config = OutputConfig::load_from_file(&path);
        let _ = fs::remove_file(&path);

        assert_eq!(config.command_queue_len, 8);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_auto_prefers_double_buffer() {
        assert_eq!(
            StrategyPreference::Auto.select(&caps(true, true)),
            Some(Strategy::DoubleBuffer)
        );
        assert_eq!(
            StrategyPreference::Auto.select(&caps(false, true)),
            Some(Strategy::Resubmit)
        );
        assert_eq!(StrategyPreference::Auto.select(&caps(false, false)), None);
    }

    #[test]
    fn test_explicit_preference_requires_capability() {
        assert_eq!(StrategyPreference::DoubleBuffer.select(&caps(false, true)), None);
        assert_eq!(StrategyPreference::Resubmit.select(&caps(true, false)), None);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "double-buffer".parse::<StrategyPreference>(),
            Ok(StrategyPreference::DoubleBuffer)
        );
        assert!("triple".parse::<StrategyPreference>().is_err());
    }
}
