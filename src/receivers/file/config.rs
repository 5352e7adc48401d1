// SPDX-License-Identifier: Apache-2.0

//! Configuration for filestream inputs and the registry.
//!
//! The layout follows the familiar filebeat shape, so nested keys such as
//! `close.on_state_change.inactive` and `prospector.scanner.check_interval`
//! map onto nested structs here.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// The only input type this agent knows how to run.
pub const FILESTREAM_INPUT_TYPE: &str = "filestream";

/// One entry of the `inputs` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDefinition {
    /// Input type, must be `filestream` to be started
    #[serde(rename = "type")]
    pub input_type: String,

    /// Identifier scoping this input's registry entries. Absent and explicitly
    /// empty are different values.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Glob patterns for files to ingest
    #[serde(default)]
    pub paths: Vec<String>,

    /// Time a closed file's state is kept before the registry drops it
    #[serde(default = "default_clean_inactive", with = "humantime_serde")]
    pub clean_inactive: Duration,

    /// Expire a closed file's state at the next sweep once the file is deleted
    #[serde(default = "default_true")]
    pub clean_removed: bool,

    /// Files last modified longer ago than this are never read
    #[serde(default, with = "humantime_serde")]
    pub ignore_older: Option<Duration>,

    /// Lines longer than this many bytes are truncated
    #[serde(default = "default_message_max_bytes")]
    pub message_max_bytes: usize,

    #[serde(default)]
    pub close: CloseConfig,

    #[serde(default)]
    pub prospector: ProspectorConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseConfig {
    #[serde(default)]
    pub on_state_change: OnStateChangeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnStateChangeConfig {
    /// Close a reader after this long without new data
    #[serde(default = "default_close_inactive", with = "humantime_serde")]
    pub inactive: Duration,

    /// Close a reader as soon as its file is deleted
    #[serde(default = "default_true")]
    pub removed: bool,

    /// Close a reader as soon as its file is renamed
    #[serde(default)]
    pub renamed: bool,
}

impl Default for OnStateChangeConfig {
    fn default() -> Self {
        Self {
            inactive: default_close_inactive(),
            removed: true,
            renamed: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProspectorConfig {
    #[serde(default)]
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    /// How often the input's paths are scanned
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Glob patterns excluded from the scan results
    #[serde(default)]
    pub exclude_files: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            exclude_files: Vec::new(),
        }
    }
}

/// Settings for the shared registry store and its garbage collector.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Directory holding `log.json` and `checkpoint.json`
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// Interval between garbage collection sweeps
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Number of appended records after which the log is compacted
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            cleanup_interval: default_cleanup_interval(),
            checkpoint_threshold: default_checkpoint_threshold(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cleanup_interval.is_zero() {
            return Err("registry.cleanup_interval must be positive".to_string());
        }
        if self.checkpoint_threshold == 0 {
            return Err("registry.checkpoint_threshold must be positive".to_string());
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_clean_inactive() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_close_inactive() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_message_max_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("data/registry")
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_checkpoint_threshold() -> u64 {
    1000
}

impl InputDefinition {
    /// A filestream definition with defaults for everything but the paths.
    pub fn filestream(id: Option<&str>, paths: Vec<String>) -> Self {
        Self {
            input_type: FILESTREAM_INPUT_TYPE.to_string(),
            id: id.map(str::to_string),
            enabled: true,
            paths,
            clean_inactive: default_clean_inactive(),
            clean_removed: true,
            ignore_older: None,
            message_max_bytes: default_message_max_bytes(),
            close: CloseConfig::default(),
            prospector: ProspectorConfig::default(),
        }
    }

    pub fn close_inactive(&self) -> Duration {
        self.close.on_state_change.inactive
    }

    pub fn check_interval(&self) -> Duration {
        self.prospector.scanner.check_interval
    }

    /// Checks that only concern this definition. Identifier uniqueness is
    /// checked across definitions by the validator.
    pub fn validate(&self) -> Result<(), String> {
        if self.input_type != FILESTREAM_INPUT_TYPE {
            return Err(format!("unsupported input type '{}'", self.input_type));
        }

        if !self.enabled {
            return Ok(());
        }

        if self.paths.is_empty() {
            return Err("paths cannot be empty".to_string());
        }

        if self.clean_inactive.is_zero() {
            return Err("clean_inactive must be positive".to_string());
        }

        if self.close_inactive().is_zero() {
            return Err("close.on_state_change.inactive must be positive".to_string());
        }

        if self.check_interval().is_zero() {
            return Err("prospector.scanner.check_interval must be positive".to_string());
        }

        if self.message_max_bytes == 0 {
            return Err("message_max_bytes must be positive".to_string());
        }

        Ok(())
    }

    /// True when state could be cleaned while its file may still be picked up
    /// again by the scanner.
    pub fn clean_inactive_too_short(&self) -> bool {
        match self.ignore_older {
            Some(ignore_older) => self.clean_inactive <= ignore_older + self.check_interval(),
            None => false,
        }
    }
}
