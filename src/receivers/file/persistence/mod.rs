// SPDX-License-Identifier: Apache-2.0

//! Persistence for the file state registry.
//!
//! An append-only JSON-lines log with periodic atomic checkpoints, fronted by
//! an in-memory index rebuilt by replay on startup.

mod json_file;
mod registry;
mod schema;
mod store;

pub use json_file::JsonFilePersister;
pub use registry::{Entry, RegistryStore};
pub use schema::{
    CHECKPOINT_FILE_NAME, CHECKPOINT_VERSION, Checkpoint, CheckpointEntry, LOG_FILE_NAME,
    Mutation, Op, RegistryKey,
};
#[cfg(test)]
pub use store::MockPersister;
pub use store::{Persisted, Persister};
