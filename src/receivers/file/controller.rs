// SPDX-License-Identifier: Apache-2.0

//! Reader lifecycle controller.
//!
//! One controller runs per input. It consumes discovery events, owns the open
//! readers for its files and drives each file's state through
//! Discovered, Reading, Inactive and Closed. Every transition is written to the
//! registry before the controller acts on it; if a write fails, ingestion of
//! that file halts and the rest of the input carries on.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::BoxError;
use crate::bounded_channel::{BoundedReceiver, TimeoutError};
use crate::receivers::file::config::InputDefinition;
use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::input::{FileId, FileReader};
use crate::receivers::file::persistence::{Entry, RegistryKey, RegistryStore};
use crate::receivers::file::scanner::{DiscoveryEvent, FileInfo};
use crate::receivers::file::sink::LineSink;
use crate::receivers::file::state::{FileState, Phase, deadline};
use crate::receivers::get_meter;

/// Upper bound on how long the run loop blocks before checking cancellation
const MAX_WAIT: Duration = Duration::from_millis(100);

pub struct ReaderController {
    input_id: String,
    config: InputDefinition,
    store: Arc<RegistryStore>,
    sink: Arc<dyn LineSink>,
    readers: HashMap<FileId, FileReader>,
    /// Identities whose registry writes failed; never read again by this controller
    halted: HashSet<FileId>,
    /// Identities last reported deleted by the scanner
    removed: HashSet<FileId>,
    lines_read: Counter<u64>,
    tags: [KeyValue; 1],
}

impl ReaderController {
    pub fn new(
        input_id: impl Into<String>,
        config: InputDefinition,
        store: Arc<RegistryStore>,
        sink: Arc<dyn LineSink>,
    ) -> Self {
        let input_id = input_id.into();
        let lines_read = get_meter()
            .u64_counter("filestream_input_lines_read")
            .with_description("Number of complete lines read from tracked files.")
            .with_unit("lines")
            .build();

        Self {
            tags: [KeyValue::new("input_id", input_id.clone())],
            input_id,
            config,
            store,
            sink,
            readers: HashMap::new(),
            halted: HashSet::new(),
            removed: HashSet::new(),
            lines_read,
        }
    }

    pub fn open_readers(&self) -> usize {
        self.readers.len()
    }

    pub fn is_halted(&self, id: &FileId) -> bool {
        self.halted.contains(id)
    }

    fn key(&self, id: FileId) -> RegistryKey {
        RegistryKey::new(self.input_id.clone(), id)
    }

    /// No reader survives a restart: close every entry of this input that
    /// was left open, so each one has a TTL.
    pub fn recover(&mut self, now: DateTime<Utc>) -> usize {
        let keys = match self.store.keys_for_input(&self.input_id) {
            Ok(keys) => keys,
            Err(e) => {
                error!(input_id = %self.input_id, "Failed to list registry entries: {}", e);
                return 0;
            }
        };

        let ttl = Some(self.config.clean_inactive);
        let (closed, failed) = close_entries(&self.store, &keys, ttl, now);
        for key in failed {
            self.halted.insert(key.file);
        }
        if closed > 0 {
            info!(
                input_id = %self.input_id,
                entries = closed,
                "Closed registry entries left open by a previous run"
            );
        }
        closed
    }

    pub fn handle_event(&mut self, event: DiscoveryEvent, now: DateTime<Utc>) {
        let id = event.id();
        if self.halted.contains(&id) {
            debug!(input_id = %self.input_id, file_id = %id, "Ignoring event for halted file");
            return;
        }

        match event {
            DiscoveryEvent::NewFile(info) | DiscoveryEvent::Modified(info) => {
                self.removed.remove(&id);
                self.ingest(&info, now);
            }
            DiscoveryEvent::Renamed { info, from } => {
                self.removed.remove(&id);
                debug!(
                    input_id = %self.input_id,
                    "File renamed: {:?} -> {:?}", from, info.path
                );
                if self.readers.contains_key(&id) && self.config.close.on_state_change.renamed {
                    self.read_file(id, now);
                    self.close_reader(id, now);
                    self.update_path(id, &info.path);
                } else {
                    self.ingest(&info, now);
                }
            }
            DiscoveryEvent::Deleted { id, path } => {
                debug!(input_id = %self.input_id, "File removed: {:?}", path);

                if self.readers.contains_key(&id) {
                    // Consumed by the reader's close
                    self.removed.insert(id);
                    if !self.config.close.on_state_change.removed {
                        // Keep draining through the open handle until inactive
                        return;
                    }
                    self.read_file(id, now);
                    self.close_reader(id, now);
                }
                if self.config.clean_removed {
                    self.expire_closed(id);
                }
            }
        }
    }

    /// Read from every open reader, then close the ones that went idle.
    pub fn poll(&mut self, now: DateTime<Utc>) {
        let ids: Vec<FileId> = self.readers.keys().copied().collect();
        for id in ids {
            self.read_file(id, now);
        }
        self.check_inactive(now);
    }

    /// Close readers that made no progress for `close.on_state_change.inactive`.
    pub fn check_inactive(&mut self, now: DateTime<Utc>) {
        let close_inactive = self.config.close_inactive();
        let ids: Vec<FileId> = self.readers.keys().copied().collect();

        for id in ids {
            match self.store.get(&self.key(id)) {
                Ok(Some(state)) if state.is_idle(now, close_inactive) => {
                    self.close_reader(id, now);
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    // GC never removes Reading entries, so the registry lost it
                    self.halt(id, Error::Persistence(format!("no state for open reader {}", id)));
                }
                Err(e) => self.halt(id, e),
            }
        }
    }

    /// Close every open reader, as on shutdown.
    pub fn close_all(&mut self, now: DateTime<Utc>) {
        let ids: Vec<FileId> = self.readers.keys().copied().collect();
        for id in ids {
            self.close_reader(id, now);
        }
    }

    pub fn run(
        mut self,
        events_rx: BoundedReceiver<DiscoveryEvent>,
        cancel: CancellationToken,
    ) -> std::result::Result<(), BoxError> {
        self.recover(Utc::now());

        let tick = self.tick_interval();
        let mut next_tick = Instant::now() + tick;

        loop {
            if cancel.is_cancelled() {
                debug!(input_id = %self.input_id, "Cancellation received, stopping controller");
                break;
            }

            let wait = next_tick.saturating_duration_since(Instant::now()).min(MAX_WAIT);
            match events_rx.recv_timeout(wait) {
                Ok(event) => self.handle_event(event, Utc::now()),
                Err(TimeoutError::Timeout) => {}
                Err(TimeoutError::Disconnected) => {
                    debug!(input_id = %self.input_id, "Event channel closed, stopping controller");
                    break;
                }
            }

            if Instant::now() >= next_tick {
                self.poll(Utc::now());
                next_tick = Instant::now() + tick;
            }
        }

        self.close_all(Utc::now());
        info!(input_id = %self.input_id, "Controller stopped");
        Ok(())
    }

    /// Inactivity is detected at this granularity.
    fn tick_interval(&self) -> Duration {
        let base = self.config.check_interval().min(self.config.close_inactive()) / 2;
        base.clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    /// Make sure a reader is open for the file and read whatever is new.
    fn ingest(&mut self, info: &FileInfo, now: DateTime<Utc>) {
        let id = info.id;

        if let Some(reader) = self.readers.get_mut(&id) {
            if reader.path() != info.path.as_path() {
                reader.set_path(info.path.clone());
                self.update_path(id, &info.path);
            }
            self.read_file(id, now);
            return;
        }

        let key = self.key(id);
        let ttl = self.config.clean_inactive;
        let ignore_older = self.config.ignore_older;
        let max_line_size = self.config.message_max_bytes;
        let input_id = self.input_id.clone();
        let store = self.store.clone();

        let opened = store.with_entry(&key, |entry| {
            let state = match entry.state() {
                Some(state) => state.clone(),
                None => {
                    let state = FileState::discovered(id, info.path.display().to_string(), ttl, now);
                    entry.put(state.clone())?;

                    if is_older(info.modified, ignore_older, now) {
                        debug!(
                            input_id = %input_id,
                            "Ignoring file {} older than ignore_older",
                            info.path.display()
                        );
                        entry.put(state.close(now)?)?;
                        return Ok(None);
                    }

                    info!(input_id = %input_id, "A new file {} has been found", info.path.display());
                    state
                }
            };

            match state.phase {
                Phase::Removed => return Ok(None),
                Phase::Closed if info.size == state.offset => {
                    // Nothing new, leave the TTL running
                    if state.source_path != info.path.display().to_string() {
                        let mut moved = state.clone();
                        moved.source_path = info.path.display().to_string();
                        entry.put(moved)?;
                    }
                    return Ok(None);
                }
                Phase::Reading => {}
                // Entries that outlived a restart are held to the same threshold
                _ if is_older(info.modified, ignore_older, now) => {
                    debug!(
                        input_id = %input_id,
                        "Not reopening {}, older than ignore_older",
                        info.path.display()
                    );
                    for next in closing_steps(&state, Some(ttl), now)? {
                        entry.put(next)?;
                    }
                    return Ok(None);
                }
                _ => {}
            }

            open_reader(entry, &input_id, state, info, max_line_size, ttl, now)
        });

        match opened {
            Ok(Some(reader)) => {
                self.readers.insert(id, reader);
                self.read_file(id, now);
            }
            Ok(None) => {}
            Err(e) => self.halt(id, e),
        }
    }

    /// Consume new complete lines from an open reader and persist the offset.
    fn read_file(&mut self, id: FileId, now: DateTime<Utc>) {
        let sink = self.sink.clone();
        let input_id = self.input_id.clone();

        let Some(reader) = self.readers.get_mut(&id) else {
            return;
        };

        let truncated = match reader.is_truncated() {
            Ok(true) => {
                info!(
                    input_id = %input_id,
                    "File {} was truncated, reading from the beginning",
                    reader.path().display()
                );
                reader.reset();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(input_id = %input_id, "Failed to check {}: {}", reader.path().display(), e);
                self.close_reader(id, now);
                return;
            }
        };

        let path = reader.path().to_path_buf();
        let summary = reader.read_lines_into(|line, begin| {
            sink.emit(&input_id, &path, begin, line);
            true
        });
        let offset = reader.offset();

        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                warn!(input_id = %input_id, "Error reading file {}: {}", path.display(), e);
                self.close_reader(id, now);
                return;
            }
        };

        if summary.bytes == 0 && !truncated {
            return;
        }
        self.lines_read.add(summary.lines, &self.tags);

        let key = self.key(id);
        let result = self.store.with_entry(&key, |entry| match entry.state().cloned() {
            Some(state) if state.phase == Phase::Reading => {
                entry.put(state.advance(offset, now)).map(|_| ())
            }
            _ => Err(Error::Persistence(format!("no reading state for {}", key))),
        });
        if let Err(e) = result {
            self.halt(id, e);
        }
    }

    /// Reading → Inactive, release the handle, then Inactive → Closed.
    fn close_reader(&mut self, id: FileId, now: DateTime<Utc>) {
        let key = self.key(id);
        let ttl = self.config.clean_inactive;
        let expire = self.removed.remove(&id) && self.config.clean_removed;
        let store = self.store.clone();
        let readers = &mut self.readers;

        let result = store.with_entry(&key, |entry| {
            let Some(state) = entry.state().cloned() else {
                readers.remove(&id);
                return Err(Error::Persistence(format!("no state for open reader {}", key)));
            };

            let inactive = match state.phase {
                Phase::Reading => {
                    let inactive = state.deactivate()?;
                    entry.put(inactive.clone())?;
                    inactive
                }
                _ => state,
            };

            let reader = readers.remove(&id);
            drop(reader);

            if inactive.phase != Phase::Inactive {
                return Ok(inactive.source_path);
            }

            let mut inactive = inactive;
            inactive.ttl = ttl;
            let mut closed = inactive.close(now)?;
            if expire {
                closed = closed.expire_at_close().unwrap_or(closed);
            }
            entry.put(closed)?;
            Ok(inactive.source_path)
        });

        match result {
            Ok(path) => {
                info!(input_id = %self.input_id, "Reader was closed. Closing. Path='{}'", path);
            }
            Err(e) => self.halt(id, e),
        }
    }

    fn update_path(&mut self, id: FileId, path: &Path) {
        let key = self.key(id);
        let path = path.display().to_string();
        let result = self.store.with_entry(&key, |entry| match entry.state() {
            Some(state) if state.source_path != path => {
                let mut moved = state.clone();
                moved.source_path = path;
                entry.put(moved).map(|_| ())
            }
            _ => Ok(()),
        });
        if let Err(e) = result {
            self.halt(id, e);
        }
    }

    /// Pull a closed entry's deadline in to its close time.
    fn expire_closed(&mut self, id: FileId) {
        let key = self.key(id);
        let result = self.store.with_entry(&key, |entry| {
            match entry.state().and_then(|s| s.expire_at_close()) {
                Some(expired) => entry.put(expired).map(|_| ()),
                None => Ok(()),
            }
        });
        if let Err(e) = result {
            self.halt(id, e);
        }
    }

    fn halt(&mut self, id: FileId, e: Error) {
        error!(
            input_id = %self.input_id,
            file_id = %id,
            "Halting ingestion of file, registry write failed: {}", e
        );
        self.readers.remove(&id);
        self.removed.remove(&id);
        self.halted.insert(id);
    }
}

/// Open the file behind `state` and persist the move to Reading. Returns None
/// when the file cannot be read, after recording it as closed.
fn open_reader(
    entry: &mut Entry<'_>,
    input_id: &str,
    state: FileState,
    info: &FileInfo,
    max_line_size: usize,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Option<FileReader>> {
    let mut reader = match FileReader::open(&info.path, state.offset, max_line_size) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(input_id = %input_id, "Failed to open {}: {}", info.path.display(), e);
            for next in closing_steps(&state, Some(ttl), now)? {
                entry.put(next)?;
            }
            return Ok(None);
        }
    };

    // The path may already point at a different file
    match reader.file_id() {
        Ok(opened) if opened == info.id => {}
        _ => {
            debug!(input_id = %input_id, "File at {} changed identity", info.path.display());
            for next in closing_steps(&state, Some(ttl), now)? {
                entry.put(next)?;
            }
            return Ok(None);
        }
    }

    let mut next = match state.phase {
        Phase::Reading => state.clone(),
        _ => state.start_reading(now)?,
    };
    next.source_path = info.path.display().to_string();
    next.ttl = ttl;

    if info.size < state.offset {
        info!(
            input_id = %input_id,
            "File {} was truncated, reading from the beginning",
            info.path.display()
        );
        reader.reset();
        next.offset = 0;
    }

    entry.put(next)?;
    Ok(Some(reader))
}

/// The states an open entry passes through on its way to Closed. Empty when
/// the entry is already closed. `ttl` replaces the stored TTL when given.
fn closing_steps(
    state: &FileState,
    ttl: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<Vec<FileState>> {
    let mut steps = Vec::new();
    let mut current = state.clone();

    if current.phase == Phase::Reading {
        current = current.deactivate()?;
        steps.push(current.clone());
    }
    if matches!(current.phase, Phase::Discovered | Phase::Inactive) {
        if let Some(ttl) = ttl {
            current.ttl = ttl;
        }
        steps.push(current.close(now)?);
    }
    Ok(steps)
}

/// Close every listed entry that is still open. Returns how many were closed
/// and the keys whose writes failed.
pub fn close_entries(
    store: &RegistryStore,
    keys: &[RegistryKey],
    ttl: Option<Duration>,
    now: DateTime<Utc>,
) -> (usize, Vec<RegistryKey>) {
    let mut closed = 0;
    let mut failed = Vec::new();

    for key in keys {
        let result = store.with_entry(key, |entry| {
            let Some(state) = entry.state().cloned() else {
                return Ok(false);
            };
            let steps = closing_steps(&state, ttl, now)?;
            let changed = !steps.is_empty();
            for next in steps {
                entry.put(next)?;
            }
            Ok(changed)
        });

        match result {
            Ok(true) => closed += 1,
            Ok(false) => {}
            Err(e) => {
                error!("Failed to close registry entry {}: {}", key, e);
                failed.push(key.clone());
            }
        }
    }

    (closed, failed)
}

fn is_older(
    modified: Option<SystemTime>,
    ignore_older: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    match (modified, ignore_older) {
        (Some(modified), Some(ignore_older)) => {
            deadline(DateTime::<Utc>::from(modified), ignore_older) < now
        }
        _ => false,
    }
}
