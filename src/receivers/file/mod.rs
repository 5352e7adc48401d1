// SPDX-License-Identifier: Apache-2.0

//! Filestream input for tailing log files.
//!
//! Each enabled input runs a scanner that reports discovery events and a
//! controller that owns the read lifecycle of every file it tracks. State is
//! kept in a registry shared by all inputs and swept by a garbage collector
//! once closed entries outlive their TTL.
//!
//! Features:
//! - Device and inode based identity across renames and rotations
//! - Write-ahead lifecycle transitions with crash recovery by replay
//! - Startup validation of input identifiers

pub mod config;
pub mod controller;
pub mod error;
pub mod gc;
pub mod input;
pub mod persistence;
pub mod scanner;
pub mod sink;
pub mod state;
pub mod validate;

pub use config::{FILESTREAM_INPUT_TYPE, InputDefinition, RegistryConfig};
pub use controller::ReaderController;
pub use error::{Error, Result};
pub use gc::GarbageCollector;
pub use input::{FileFinder, FileId, FileReader, GlobFileFinder};
pub use persistence::{JsonFilePersister, Persister, RegistryKey, RegistryStore};
pub use scanner::{DiscoveryEvent, FileInfo, Scanner};
pub use sink::{DiscardSink, LineSink};
pub use state::{FileState, Phase};
pub use validate::{ResolvedInput, ValidationError, validate, validate_input_ids};
