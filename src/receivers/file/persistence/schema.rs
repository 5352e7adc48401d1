// SPDX-License-Identifier: Apache-2.0

//! On-disk schema of the registry.
//!
//! The registry directory holds two files:
//! - `log.json`: one [`Mutation`] per line, appended and fsynced in order
//! - `checkpoint.json`: a [`Checkpoint`] of every live entry as of some sequence number

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::receivers::file::input::FileId;
use crate::receivers::file::state::FileState;

/// Name of the append-only mutation log inside the registry directory
pub const LOG_FILE_NAME: &str = "log.json";

/// Name of the checkpoint file inside the registry directory
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

/// Current schema version for checkpoints
pub const CHECKPOINT_VERSION: u8 = 1;

/// Registry entries are scoped by input, so two inputs reading the same file
/// keep independent lifecycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryKey {
    pub input_id: String,
    pub file: FileId,
}

impl RegistryKey {
    pub fn new(input_id: impl Into<String>, file: FileId) -> Self {
        Self {
            input_id: input_id.into(),
            file,
        }
    }
}

/// Rendered as `<input_id>::<dev>-<ino>`.
impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}-{}", self.input_id, self.file.dev(), self.file.ino())
    }
}

impl FromStr for RegistryKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Input ids may themselves contain "::", the file part never does
        let (input_id, file) = s
            .rsplit_once("::")
            .ok_or_else(|| format!("invalid registry key '{}'", s))?;
        let (dev, ino) = file
            .split_once('-')
            .ok_or_else(|| format!("invalid file identity in registry key '{}'", s))?;
        let dev = dev
            .parse::<u64>()
            .map_err(|e| format!("invalid device in registry key '{}': {}", s, e))?;
        let ino = ino
            .parse::<u64>()
            .map_err(|e| format!("invalid inode in registry key '{}': {}", s, e))?;

        Ok(RegistryKey::new(input_id, FileId::new(dev, ino)))
    }
}

impl Serialize for RegistryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RegistryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Create,
    Update,
    Remove,
}

/// One line of the registry log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub seq: u64,
    pub op: Op,
    pub key: RegistryKey,
    /// Present for create and update, absent for remove
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FileState>,
}

/// A single live entry inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub key: RegistryKey,
    pub state: FileState,
}

/// Snapshot of every live entry. Log records with a sequence number at or
/// below `seq` are already reflected here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u8,
    pub seq: u64,
    pub states: Vec<CheckpointEntry>,
}

impl Checkpoint {
    pub fn new(seq: u64, states: Vec<CheckpointEntry>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            seq,
            states,
        }
    }
}
