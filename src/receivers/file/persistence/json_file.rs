// SPDX-License-Identifier: Apache-2.0

//! JSON file-based persistence.
//!
//! Mutations are appended to `log.json` as one JSON object per line and
//! fsynced before the append returns. Checkpoints are written atomically
//! using a write-to-temp-then-rename strategy, after which the log is cut.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::receivers::file::error::{Error, Result};
use crate::receivers::file::persistence::schema::{
    CHECKPOINT_FILE_NAME, Checkpoint, LOG_FILE_NAME, Mutation,
};
use crate::receivers::file::persistence::store::{Persisted, Persister};

/// A persister backed by a registry directory.
pub struct JsonFilePersister {
    dir: PathBuf,
    log: File,
    /// Length of the log after the last acknowledged append
    log_len: u64,
}

impl JsonFilePersister {
    /// Open or create the registry directory at the given path
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::Persistence(format!(
                "failed to create registry directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let log_path = dir.join(LOG_FILE_NAME);
        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                Error::Persistence(format!(
                    "failed to open registry log {}: {}",
                    log_path.display(),
                    e
                ))
            })?;
        let log_len = log.metadata()?.len();

        Ok(Self { dir, log, log_len })
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE_NAME)
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read(&path)
            .map_err(|e| Error::Persistence(format!("failed to read checkpoint: {}", e)))?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    fn load_log(&mut self) -> Result<Vec<Mutation>> {
        let mut content = Vec::new();
        let mut file = File::open(self.log_path())?;
        file.read_to_end(&mut content)?;

        let mut records = Vec::new();
        let mut start = 0usize;
        let mut line_no = 0usize;

        while start < content.len() {
            line_no += 1;
            let Some(len) = content[start..].iter().position(|b| *b == b'\n') else {
                // An unterminated last line is a write that never completed,
                // so it was never acknowledged. Cut it.
                warn!(
                    line = line_no,
                    bytes = content.len() - start,
                    "Discarding torn record at the end of the registry log"
                );
                self.log.set_len(start as u64)?;
                self.log.sync_data()?;
                break;
            };

            let line = &content[start..start + len];
            start += len + 1;

            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            let record: Mutation = serde_json::from_slice(line).map_err(|e| {
                Error::Persistence(format!("corrupt registry log at line {}: {}", line_no, e))
            })?;
            records.push(record);
        }

        self.log_len = self.log.metadata()?.len();
        Ok(records)
    }
}

impl Persister for JsonFilePersister {
    fn append(&mut self, record: &Mutation) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let result = self
            .log
            .write_all(&line)
            .and_then(|_| self.log.sync_data());

        if let Err(e) = result {
            // Leave no partial line behind for the next append to land on
            if let Err(trunc_err) = self.log.set_len(self.log_len) {
                warn!(error = %trunc_err, "Failed to cut partial registry record");
            }
            return Err(Error::Persistence(format!(
                "failed to append registry record {}: {}",
                record.seq, e
            )));
        }

        self.log_len += line.len() as u64;
        Ok(())
    }

    fn checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        atomic_write(&self.checkpoint_path(), checkpoint)?;

        // Records up to checkpoint.seq are skipped on replay, so a crash
        // between the rename and this truncation is harmless.
        self.log
            .set_len(0)
            .and_then(|_| self.log.sync_data())
            .map_err(|e| Error::Persistence(format!("failed to truncate registry log: {}", e)))?;
        self.log_len = 0;
        Ok(())
    }

    fn load(&mut self) -> Result<Persisted> {
        let checkpoint = self.load_checkpoint()?;
        let records = self.load_log()?;
        Ok(Persisted {
            checkpoint,
            records,
        })
    }
}

/// Write a value to file atomically (write to temp, then rename)
fn atomic_write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    // Combine process ID with a counter to keep concurrent writers apart
    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| Error::Persistence(format!("failed to write checkpoint: {}", e)))?;

    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush checkpoint: {}", e)))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| Error::Persistence(format!("failed to sync checkpoint: {}", e)))?;
    drop(writer);

    fs::rename(&temp_path, path)
        .map_err(|e| Error::Persistence(format!("failed to rename checkpoint file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receivers::file::input::FileId;
    use crate::receivers::file::persistence::schema::{CheckpointEntry, Op, RegistryKey};
    use crate::receivers::file::state::FileState;
    use chrono::Utc;
    use std::time::Duration;

    fn record(seq: u64, op: Op, ino: u64) -> Mutation {
        let file = FileId::new(1, ino);
        let state = match op {
            Op::Remove => None,
            _ => Some(FileState::discovered(
                file,
                format!("/var/log/{}.log", ino),
                Duration::from_secs(60),
                Utc::now(),
            )),
        };
        Mutation {
            seq,
            op,
            key: RegistryKey::new("test", file),
            state,
        }
    }

    #[test]
    fn test_append_and_load() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut persister = JsonFilePersister::open(dir.path()).unwrap();
            persister.append(&record(1, Op::Create, 10)).unwrap();
            persister.append(&record(2, Op::Update, 10)).unwrap();
            persister.append(&record(3, Op::Remove, 10)).unwrap();
        }

        let content = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains(r#""op":"remove""#));

        let mut persister = JsonFilePersister::open(dir.path()).unwrap();
        let persisted = persister.load().unwrap();
        assert!(persisted.checkpoint.is_none());
        let seqs: Vec<u64> = persisted.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_torn_tail_is_cut() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut persister = JsonFilePersister::open(dir.path()).unwrap();
            persister.append(&record(1, Op::Create, 10)).unwrap();
        }

        let log_path = dir.path().join(LOG_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(br#"{"seq":2,"op":"upd"#).unwrap();
        drop(file);

        let mut persister = JsonFilePersister::open(dir.path()).unwrap();
        let persisted = persister.load().unwrap();
        assert_eq!(persisted.records.len(), 1);

        // The next append starts on a clean line
        persister.append(&record(2, Op::Update, 10)).unwrap();
        let persisted = persister.load().unwrap();
        assert_eq!(persisted.records.len(), 2);
    }

    #[test]
    fn test_corrupt_middle_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut persister = JsonFilePersister::open(dir.path()).unwrap();
            persister.append(&record(1, Op::Create, 10)).unwrap();
        }

        let log_path = dir.path().join(LOG_FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(b"not json\n").unwrap();
        drop(file);

        {
            let mut persister = JsonFilePersister::open(dir.path()).unwrap();
            persister.append(&record(2, Op::Update, 10)).unwrap();
        }

        let mut persister = JsonFilePersister::open(dir.path()).unwrap();
        let err = persister.load().unwrap_err().to_string();
        assert!(err.contains("line 2"), "{}", err);
    }

    #[test]
    fn test_checkpoint_truncates_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut persister = JsonFilePersister::open(dir.path()).unwrap();
        persister.append(&record(1, Op::Create, 10)).unwrap();
        persister.append(&record(2, Op::Create, 11)).unwrap();

        let live = record(2, Op::Create, 11);
        let checkpoint = Checkpoint::new(
            2,
            vec![CheckpointEntry {
                key: live.key.clone(),
                state: live.state.clone().unwrap(),
            }],
        );
        persister.checkpoint(&checkpoint).unwrap();
        assert_eq!(fs::metadata(persister.log_path()).unwrap().len(), 0);

        persister.append(&record(3, Op::Remove, 11)).unwrap();

        let mut reopened = JsonFilePersister::open(dir.path()).unwrap();
        let persisted = reopened.load().unwrap();
        assert_eq!(persisted.checkpoint, Some(checkpoint));
        assert_eq!(persisted.records.len(), 1);
        assert_eq!(persisted.records[0].seq, 3);

        // No temp files left behind
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CHECKPOINT_FILE_NAME), "{").unwrap();

        let mut persister = JsonFilePersister::open(dir.path()).unwrap();
        let err = persister.load().unwrap_err();
        assert!(matches!(err, Error::Json(_)), "{}", err);
    }

    #[test]
    fn test_checkpoint_with_wrong_shape_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CHECKPOINT_FILE_NAME), r#"{"seq": "one"}"#).unwrap();

        let mut persister = JsonFilePersister::open(dir.path()).unwrap();
        let err = persister.load().unwrap_err();
        assert!(matches!(err, Error::Json(_)), "{}", err);
        assert!(err.to_string().starts_with("JSON parsing error"));
    }
}
