// SPDX-License-Identifier: Apache-2.0

//! Periodic discovery of files matching an input's patterns.
//!
//! Each scan lists the matching paths, resolves every path to its [`FileId`]
//! and diffs the result against the previous scan. Identity, not path, decides
//! whether a file is new: a reused path with a different identity is a new
//! file, a known identity under a different path is a rename.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BoxError;
use crate::bounded_channel::BoundedSender;
use crate::receivers::file::input::{FileFinder, FileId};

/// How long a blocking loop sleeps between cancellation checks
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// A file as observed by one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub id: FileId,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// An identity not seen by the previous scan
    NewFile(FileInfo),
    /// Known identity whose size or modification time changed
    Modified(FileInfo),
    /// Known identity now found under another path
    Renamed { info: FileInfo, from: PathBuf },
    /// Known identity no longer matched by any pattern
    Deleted { id: FileId, path: PathBuf },
}

impl DiscoveryEvent {
    pub fn id(&self) -> FileId {
        match self {
            DiscoveryEvent::NewFile(info)
            | DiscoveryEvent::Modified(info)
            | DiscoveryEvent::Renamed { info, .. } => info.id,
            DiscoveryEvent::Deleted { id, .. } => *id,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            DiscoveryEvent::NewFile(info)
            | DiscoveryEvent::Modified(info)
            | DiscoveryEvent::Renamed { info, .. } => &info.path,
            DiscoveryEvent::Deleted { path, .. } => path,
        }
    }
}

pub struct Scanner {
    input_id: String,
    finder: Box<dyn FileFinder>,
    known: HashMap<FileId, FileInfo>,
    /// When discovery started failing, if it currently is
    first_failure: Option<Instant>,
}

impl Scanner {
    pub fn new(input_id: impl Into<String>, finder: Box<dyn FileFinder>) -> Self {
        Self {
            input_id: input_id.into(),
            finder,
            known: HashMap::new(),
            first_failure: None,
        }
    }

    /// Forget every file seen so far. The next scan reports all present
    /// files as new.
    pub fn reset(&mut self) {
        self.known.clear();
    }

    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    /// Run one discovery pass and return what changed since the last one.
    pub fn scan(&mut self) -> Vec<DiscoveryEvent> {
        let paths = match self.finder.find_files() {
            Ok(paths) => {
                if let Some(since) = self.first_failure.take() {
                    debug!(
                        input_id = %self.input_id,
                        "File discovery succeeded after failing for {:?}",
                        since.elapsed()
                    );
                }
                paths
            }
            Err(e) => {
                // Known files are kept as-is; nothing is reported deleted
                // because of a listing failure
                let since = *self.first_failure.get_or_insert_with(Instant::now);
                warn!(
                    input_id = %self.input_id,
                    "File discovery failed (failures started {:?} ago): {}",
                    since.elapsed(),
                    e
                );
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let mut seen: HashMap<FileId, FileInfo> = HashMap::with_capacity(paths.len());
        let mut unresolved: HashSet<PathBuf> = HashSet::new();

        for path in paths {
            let info = match stat(&path) {
                Ok(info) => info,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Gone between listing and stat, reported below if it was known
                    debug!(input_id = %self.input_id, "File {:?} vanished during scan", path);
                    continue;
                }
                Err(e) => {
                    warn!(
                        input_id = %self.input_id,
                        "Failed to stat {:?}, retrying next scan: {}", path, e
                    );
                    unresolved.insert(path);
                    continue;
                }
            };

            // The same file reached through several paths is reported once
            if seen.contains_key(&info.id) {
                continue;
            }

            match self.known.get(&info.id) {
                None => events.push(DiscoveryEvent::NewFile(info.clone())),
                Some(prev) if prev.path != info.path => {
                    events.push(DiscoveryEvent::Renamed {
                        info: info.clone(),
                        from: prev.path.clone(),
                    });
                }
                Some(prev) if prev.size != info.size || prev.modified != info.modified => {
                    events.push(DiscoveryEvent::Modified(info.clone()));
                }
                Some(_) => {}
            }
            seen.insert(info.id, info);
        }

        for (id, prev) in self.known.drain() {
            if seen.contains_key(&id) {
                continue;
            }
            if unresolved.contains(&prev.path) {
                // Could not tell what is at this path right now, keep it
                seen.insert(id, prev);
                continue;
            }
            events.push(DiscoveryEvent::Deleted {
                id,
                path: prev.path,
            });
        }

        self.known = seen;
        events
    }

    /// Scan every `check_interval` and forward events until cancelled or the
    /// receiving controller goes away.
    pub fn run(
        mut self,
        events_tx: BoundedSender<DiscoveryEvent>,
        check_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        info!(input_id = %self.input_id, "Scanner started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            for event in self.scan() {
                if events_tx.send_blocking(event).is_err() {
                    debug!(input_id = %self.input_id, "Event channel closed, stopping scanner");
                    return Ok(());
                }
            }

            if !sleep_unless_cancelled(check_interval, &cancel) {
                break;
            }
        }

        info!(input_id = %self.input_id, "Scanner stopped");
        Ok(())
    }
}

fn stat(path: &Path) -> io::Result<FileInfo> {
    let metadata = fs::metadata(path)?;
    let id = FileId::from_metadata(path, &metadata)?;
    Ok(FileInfo {
        id,
        path: path.to_path_buf(),
        size: metadata.len(),
        modified: metadata.modified().ok(),
    })
}

/// Sleep for `duration` on a blocking thread, waking early on cancellation.
/// Returns false when cancelled.
pub(crate) fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(CANCEL_CHECK_INTERVAL.min(deadline - now));
    }
}
