//! Configuration for the container metadata store
//!
//! The store is configured either from a deserialized file section or
//! from the flat key/value option map handed over by the embedding
//! service (`StoreConfig::from_options`).

use crate::error::{Error, Result};
use crate::types::StoreMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Container metadata store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the change log file
    pub changelog_path: PathBuf,
    /// Follow a log written by a primary instead of owning it
    #[serde(default)]
    pub slave_mode: bool,
    /// Follower poll interval when no new bytes are available
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Tolerate trailing corruption at boot
    #[serde(default)]
    pub auto_repair: bool,
    /// fsync after every appended record
    #[serde(default = "default_sync_on_write")]
    pub sync_on_write: bool,
    /// Buffer size for the log writer
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    /// Worker threads used to deserialize containers at boot
    #[serde(default = "default_boot_threads")]
    pub boot_threads: usize,
    /// Log boot progress every this many records
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    /// Keep a copy of the followed log when promoting to primary
    #[serde(default = "default_keep_failover_copy")]
    pub keep_failover_copy: bool,
}

fn default_poll_interval_us() -> u64 {
    1000
}

fn default_sync_on_write() -> bool {
    true
}

fn default_write_buffer_size() -> usize {
    64 * 1024 // 64KB
}

fn default_boot_threads() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

fn default_progress_interval() -> u64 {
    100_000
}

fn default_keep_failover_copy() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            changelog_path: PathBuf::from("/var/lib/dirlog/containers.mdlog"),
            slave_mode: false,
            poll_interval_us: default_poll_interval_us(),
            auto_repair: false,
            sync_on_write: default_sync_on_write(),
            write_buffer_size: default_write_buffer_size(),
            boot_threads: default_boot_threads(),
            progress_interval: default_progress_interval(),
            keep_failover_copy: default_keep_failover_copy(),
        }
    }
}

impl StoreConfig {
    /// Create config for a change log path with default options
    pub fn with_changelog(path: impl Into<PathBuf>) -> Self {
        Self {
            changelog_path: path.into(),
            ..Default::default()
        }
    }

    /// Build a config from the flat option map
    ///
    /// `changelog_path` is required. Unknown keys are rejected so that a
    /// misspelled option does not silently fall back to its default.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let path = options
            .get("changelog_path")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::configuration("changelog_path must be specified"))?;

        let mut config = Self::with_changelog(path);

        for (key, value) in options {
            match key.as_str() {
                "changelog_path" => {}
                "slave_mode" => config.slave_mode = parse_bool(key, value)?,
                "auto_repair" => config.auto_repair = parse_bool(key, value)?,
                "sync_on_write" => config.sync_on_write = parse_bool(key, value)?,
                "keep_failover_copy" => config.keep_failover_copy = parse_bool(key, value)?,
                "poll_interval_us" => config.poll_interval_us = parse_num(key, value)?,
                "progress_interval" => config.progress_interval = parse_num(key, value)?,
                "write_buffer_size" => config.write_buffer_size = parse_num(key, value)?,
                "boot_threads" => config.boot_threads = parse_num(key, value)?,
                other => {
                    return Err(Error::configuration(format!("unknown option: {other}")));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if self.changelog_path.as_os_str().is_empty() {
            return Err(Error::configuration("changelog_path must be specified"));
        }
        if self.poll_interval_us == 0 {
            return Err(Error::configuration("poll_interval_us must be positive"));
        }
        if self.boot_threads == 0 {
            return Err(Error::configuration("boot_threads must be positive"));
        }
        Ok(())
    }

    /// Mode selected by `slave_mode`
    #[must_use]
    pub const fn mode(&self) -> StoreMode {
        StoreMode::from_slave_flag(self.slave_mode)
    }

    /// Follower poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{key} must be true or false, got {value:?}"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::configuration(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_from_options() {
        let config = StoreConfig::from_options(&options(&[("changelog_path", "/tmp/c.mdlog")]))
            .unwrap();
        assert_eq!(config.changelog_path, PathBuf::from("/tmp/c.mdlog"));
        assert!(!config.slave_mode);
        assert!(!config.auto_repair);
        assert_eq!(config.poll_interval_us, 1000);
        assert_eq!(config.mode(), StoreMode::Primary);
    }

    #[test]
    fn test_options_override() {
        let config = StoreConfig::from_options(&options(&[
            ("changelog_path", "/tmp/c.mdlog"),
            ("slave_mode", "true"),
            ("poll_interval_us", "250"),
            ("auto_repair", "true"),
        ]))
        .unwrap();
        assert_eq!(config.mode(), StoreMode::Replica);
        assert_eq!(config.poll_interval(), Duration::from_micros(250));
        assert!(config.auto_repair);
    }

    #[test]
    fn test_missing_path_rejected() {
        let err = StoreConfig::from_options(&options(&[("slave_mode", "true")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(
            StoreConfig::from_options(&options(&[
                ("changelog_path", "/tmp/c.mdlog"),
                ("slave_mode", "yes"),
            ]))
            .is_err()
        );
        assert!(
            StoreConfig::from_options(&options(&[
                ("changelog_path", "/tmp/c.mdlog"),
                ("poll_interval_us", "0"),
            ]))
            .is_err()
        );
        assert!(
            StoreConfig::from_options(&options(&[
                ("changelog_path", "/tmp/c.mdlog"),
                ("pol_interval", "10"),
            ]))
            .is_err()
        );
    }
}
