// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::receivers::file::input::FileId;

/// Totals for a single read pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadSummary {
    /// Bytes consumed, including line terminators
    pub bytes: u64,
    /// Complete lines consumed
    pub lines: u64,
}

/// FileReader holds the open handle for one tracked file and consumes
/// complete lines from the stored offset.
pub struct FileReader {
    /// Path the file was opened at (informational, may be stale after a rename)
    path: PathBuf,
    /// The open file handle
    file: File,
    /// Current offset in bytes
    offset: u64,
    /// Lines longer than this are truncated before being handed out
    max_line_size: usize,
}

impl FileReader {
    /// Open `path` and position the reader at `offset`.
    pub fn open(path: impl AsRef<Path>, offset: u64, max_line_size: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file,
            offset,
            max_line_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Identity of the open handle, which may differ from what is now at `path`.
    pub fn file_id(&self) -> io::Result<FileId> {
        FileId::from_file(&self.file)
    }

    /// Move the read position back to the beginning of the file.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Whether the file is now shorter than what has already been consumed.
    pub fn is_truncated(&self) -> io::Result<bool> {
        Ok(self.file.metadata()?.len() < self.offset)
    }

    /// Read every complete line after the current offset, passing each one and
    /// its starting offset to `on_line`. Returning false from the callback stops
    /// the pass after that line. A trailing line without a terminator is left
    /// unread so it is picked up whole once the writer finishes it.
    pub fn read_lines_into<F>(&mut self, mut on_line: F) -> io::Result<ReadSummary>
    where
        F: FnMut(String, u64) -> bool,
    {
        self.file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut buf = Vec::with_capacity(256);
        let mut summary = ReadSummary::default();

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }

            let begin = self.offset;
            self.offset += n as u64;
            summary.bytes += n as u64;
            summary.lines += 1;

            let mut line = &buf[..n - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.len() > self.max_line_size {
                line = &line[..self.max_line_size];
            }

            if !on_line(String::from_utf8_lossy(line).into_owned(), begin) {
                break;
            }
        }

        Ok(summary)
    }
}
