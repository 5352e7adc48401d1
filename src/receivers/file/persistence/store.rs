// SPDX-License-Identifier: Apache-2.0

use crate::receivers::file::error::Result;
use crate::receivers::file::persistence::schema::{Checkpoint, Mutation};

/// Everything a persister holds, as found at startup.
#[derive(Debug, Default)]
pub struct Persisted {
    pub checkpoint: Option<Checkpoint>,
    /// Log records in the order they were appended
    pub records: Vec<Mutation>,
}

/// Durable backend of the registry store.
pub trait Persister: Send {
    /// Append one record. Must not return Ok before the record is durable.
    fn append(&mut self, record: &Mutation) -> Result<()>;

    /// Replace the checkpoint, then drop the log records it covers.
    fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()>;

    /// Read the checkpoint and log as currently persisted.
    fn load(&mut self) -> Result<Persisted>;
}

/// In-memory persister for testing. Clones share the same storage so a test
/// can keep a handle after moving one into a store.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockPersister {
    inner: std::sync::Arc<std::sync::Mutex<MockState>>,
}

#[cfg(test)]
#[derive(Default)]
struct MockState {
    checkpoint: Option<Checkpoint>,
    records: Vec<Mutation>,
    fail_appends: bool,
}

#[cfg(test)]
impl MockPersister {
    /// Create an empty mock persister
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following append fail (or succeed again)
    pub fn set_failing(&self, fail: bool) {
        self.inner.lock().unwrap().fail_appends = fail;
    }

    /// Records appended since the last checkpoint
    pub fn records(&self) -> Vec<Mutation> {
        self.inner.lock().unwrap().records.clone()
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.lock().unwrap().checkpoint.clone()
    }
}

#[cfg(test)]
impl Persister for MockPersister {
    fn append(&mut self, record: &Mutation) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.fail_appends {
            return Err(crate::receivers::file::error::Error::Persistence(
                "mock append failure".to_string(),
            ));
        }
        state.records.push(record.clone());
        Ok(())
    }

    fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.checkpoint = Some(checkpoint.clone());
        state.records.clear();
        Ok(())
    }

    fn load(&mut self) -> Result<Persisted> {
        let state = self.inner.lock().unwrap();
        Ok(Persisted {
            checkpoint: state.checkpoint.clone(),
            records: state.records.clone(),
        })
    }
}
