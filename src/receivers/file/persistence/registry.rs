// SPDX-License-Identifier: Apache-2.0

//! The registry store: an append-only mutation log with an in-memory index.
//!
//! Every key has its own slot mutex. Controllers and the garbage collector
//! both go through [`RegistryStore::with_entry`], which holds the slot for the
//! whole read-decide-write sequence. Appends are serialized by the log mutex,
//! which also assigns sequence numbers. Locks are always taken in the order
//! slot, log, index.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::receivers::file::config::RegistryConfig;
use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::persistence::json_file::JsonFilePersister;
use crate::receivers::file::persistence::schema::{
    Checkpoint, CheckpointEntry, Mutation, Op, RegistryKey,
};
use crate::receivers::file::persistence::store::{Persisted, Persister};
use crate::receivers::file::state::FileState;

struct Slot {
    state: Option<FileState>,
    /// Set once the slot has been unlinked from the index; holders must
    /// look the key up again
    retired: bool,
}

struct LogWriter {
    persister: Box<dyn Persister>,
    next_seq: u64,
    since_checkpoint: u64,
    /// Latest durable state per live key, the source for checkpoints
    persisted: HashMap<RegistryKey, FileState>,
}

impl LogWriter {
    fn checkpoint(&mut self) -> Result<()> {
        let mut states: Vec<CheckpointEntry> = self
            .persisted
            .iter()
            .map(|(key, state)| CheckpointEntry {
                key: key.clone(),
                state: state.clone(),
            })
            .collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));

        let checkpoint = Checkpoint::new(self.next_seq - 1, states);
        self.persister.checkpoint(&checkpoint)?;
        self.since_checkpoint = 0;
        debug!(
            seq = checkpoint.seq,
            entries = checkpoint.states.len(),
            "Wrote registry checkpoint"
        );
        Ok(())
    }
}

/// Durable registry of file states, shared as `Arc<RegistryStore>`.
pub struct RegistryStore {
    log: Mutex<LogWriter>,
    index: RwLock<HashMap<RegistryKey, Arc<Mutex<Slot>>>>,
    checkpoint_threshold: u64,
}

/// Locked view of one key, handed to [`RegistryStore::with_entry`] closures.
pub struct Entry<'a> {
    store: &'a RegistryStore,
    key: &'a RegistryKey,
    slot: &'a mut Slot,
}

impl Entry<'_> {
    pub fn key(&self) -> &RegistryKey {
        self.key
    }

    pub fn state(&self) -> Option<&FileState> {
        self.slot.state.as_ref()
    }

    /// Durably record `state` for this key, then make it visible.
    pub fn put(&mut self, state: FileState) -> Result<u64> {
        let op = if self.slot.state.is_some() {
            Op::Update
        } else {
            Op::Create
        };
        let seq = self.store.write_log(self.key, op, Some(state.clone()))?;
        self.slot.state = Some(state);
        Ok(seq)
    }

    /// Durably record the removal of this key. Returns None when there was
    /// nothing to remove.
    pub fn remove(&mut self) -> Result<Option<u64>> {
        if self.slot.state.is_none() {
            return Ok(None);
        }
        let seq = self.store.write_log(self.key, Op::Remove, None)?;
        self.slot.state = None;
        Ok(Some(seq))
    }
}

impl RegistryStore {
    /// Open the registry directory named by the configuration and replay it.
    pub fn open(config: &RegistryConfig) -> Result<Self> {
        let persister = JsonFilePersister::open(&config.path)?;
        Self::with_persister(Box::new(persister), config.checkpoint_threshold)
    }

    /// Build a store on top of any persister, replaying what it holds.
    pub fn with_persister(
        mut persister: Box<dyn Persister>,
        checkpoint_threshold: u64,
    ) -> Result<Self> {
        let persisted = persister.load()?;
        let replayed = apply(persisted)?;

        info!(
            entries = replayed.states.len(),
            last_seq = replayed.last_seq,
            "Registry replayed"
        );

        let index = replayed
            .states
            .iter()
            .map(|(key, (state, _))| {
                let slot = Slot {
                    state: Some(state.clone()),
                    retired: false,
                };
                (key.clone(), Arc::new(Mutex::new(slot)))
            })
            .collect();

        let persisted = replayed
            .states
            .into_iter()
            .map(|(key, (state, _))| (key, state))
            .collect();

        Ok(Self {
            log: Mutex::new(LogWriter {
                persister,
                next_seq: replayed.last_seq + 1,
                since_checkpoint: replayed.pending,
                persisted,
            }),
            index: RwLock::new(index),
            checkpoint_threshold: checkpoint_threshold.max(1),
        })
    }

    /// Replay a registry directory without opening it for writing. States are
    /// returned in the order of their last mutation.
    pub fn replay(dir: impl AsRef<Path>) -> Result<Vec<(RegistryKey, FileState)>> {
        let mut persister = JsonFilePersister::open(dir)?;
        let replayed = apply(persister.load()?)?;

        let mut states: Vec<_> = replayed.states.into_iter().collect();
        states.sort_by_key(|(_, (_, seq))| *seq);
        Ok(states
            .into_iter()
            .map(|(key, (state, _))| (key, state))
            .collect())
    }

    /// Run `f` with exclusive access to `key`. The slot is created on demand
    /// and unlinked again when `f` leaves it empty.
    pub fn with_entry<R>(
        &self,
        key: &RegistryKey,
        f: impl FnOnce(&mut Entry<'_>) -> Result<R>,
    ) -> Result<R> {
        loop {
            let slot = self.slot(key)?;
            let mut guard = slot.lock().map_err(|e| Error::Persistence(e.to_string()))?;
            if guard.retired {
                continue;
            }

            let mut entry = Entry {
                store: self,
                key,
                slot: &mut *guard,
            };
            let result = f(&mut entry);

            if guard.state.is_none() {
                guard.retired = true;
                self.unlink(key, &slot)?;
            }
            return result;
        }
    }

    /// Create, update or remove `key` through its slot.
    pub fn append(&self, key: &RegistryKey, op: Op, state: Option<FileState>) -> Result<u64> {
        self.with_entry(key, |entry| match (op, state) {
            (Op::Remove, _) => Ok(entry.remove()?.unwrap_or(0)),
            (_, Some(state)) => entry.put(state),
            (_, None) => Err(Error::Persistence(format!(
                "{:?} for {} carries no state",
                op, key
            ))),
        })
    }

    /// Current state for `key`, if any.
    pub fn get(&self, key: &RegistryKey) -> Result<Option<FileState>> {
        let slot = {
            let index = self
                .index
                .read()
                .map_err(|e| Error::Persistence(e.to_string()))?;
            match index.get(key) {
                Some(slot) => slot.clone(),
                None => return Ok(None),
            }
        };
        let guard = slot.lock().map_err(|e| Error::Persistence(e.to_string()))?;
        Ok(guard.state.clone())
    }

    /// Snapshot of every key currently indexed.
    pub fn keys(&self) -> Result<Vec<RegistryKey>> {
        let index = self
            .index
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let mut keys: Vec<_> = index.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Keys belonging to one input.
    pub fn keys_for_input(&self, input_id: &str) -> Result<Vec<RegistryKey>> {
        Ok(self
            .keys()?
            .into_iter()
            .filter(|k| k.input_id == input_id)
            .collect())
    }

    /// Snapshot of every live entry.
    pub fn states(&self) -> Result<Vec<(RegistryKey, FileState)>> {
        let mut states = Vec::new();
        for key in self.keys()? {
            if let Some(state) = self.get(&key)? {
                states.push((key, state));
            }
        }
        Ok(states)
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|index| index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a checkpoint now and cut the log.
    pub fn checkpoint(&self) -> Result<()> {
        let mut log = self
            .log
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        log.checkpoint()
    }

    /// Final checkpoint on shutdown.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()?;
        info!(entries = self.len(), "Registry closed");
        Ok(())
    }

    fn slot(&self, key: &RegistryKey) -> Result<Arc<Mutex<Slot>>> {
        if let Some(slot) = self
            .index
            .read()
            .map_err(|e| Error::Persistence(e.to_string()))?
            .get(key)
        {
            return Ok(slot.clone());
        }

        let mut index = self
            .index
            .write()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let slot = index.entry(key.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                state: None,
                retired: false,
            }))
        });
        Ok(slot.clone())
    }

    fn unlink(&self, key: &RegistryKey, slot: &Arc<Mutex<Slot>>) -> Result<()> {
        let mut index = self
            .index
            .write()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if index.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            index.remove(key);
        }
        Ok(())
    }

    fn write_log(&self, key: &RegistryKey, op: Op, state: Option<FileState>) -> Result<u64> {
        let mut log = self
            .log
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let record = Mutation {
            seq: log.next_seq,
            op,
            key: key.clone(),
            state,
        };
        log.persister.append(&record)?;

        log.next_seq += 1;
        log.since_checkpoint += 1;
        match record.state {
            Some(state) => {
                log.persisted.insert(record.key, state);
            }
            None => {
                log.persisted.remove(&record.key);
            }
        }

        if log.since_checkpoint >= self.checkpoint_threshold {
            // The record is already durable in the log, a failed compaction
            // only means the log keeps growing until the next attempt
            if let Err(e) = log.checkpoint() {
                warn!(error = %e, "Failed to compact registry log");
            }
        }

        Ok(record.seq)
    }
}

struct Replayed {
    /// Live state per key and the sequence number that last wrote it
    states: HashMap<RegistryKey, (FileState, u64)>,
    last_seq: u64,
    /// Log records applied on top of the checkpoint
    pending: u64,
}

/// Apply a checkpoint and the log records after it: create builds, update
/// overwrites, remove deletes.
fn apply(persisted: Persisted) -> Result<Replayed> {
    let mut states = HashMap::new();
    let mut last_seq = 0;
    let mut pending = 0;

    if let Some(checkpoint) = persisted.checkpoint {
        last_seq = checkpoint.seq;
        for entry in checkpoint.states {
            states.insert(entry.key, (entry.state, checkpoint.seq));
        }
    }

    let mut records = persisted.records;
    records.sort_by_key(|r| r.seq);

    for record in records {
        if record.seq <= last_seq {
            continue;
        }
        last_seq = record.seq;
        pending += 1;

        match (record.op, record.state) {
            (Op::Remove, _) => {
                states.remove(&record.key);
            }
            (_, Some(state)) => {
                states.insert(record.key, (state, record.seq));
            }
            (op, None) => {
                return Err(Error::Persistence(format!(
                    "registry record {} ({:?} {}) has no state",
                    record.seq, op, record.key
                )));
            }
        }
    }

    Ok(Replayed {
        states,
        last_seq,
        pending,
    })
}
