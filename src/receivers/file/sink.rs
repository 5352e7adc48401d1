// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

/// Destination for lines read from tracked files. Delivery downstream is the
/// sink's business; the controller only hands lines over in file order.
pub trait LineSink: Send + Sync {
    fn emit(&self, input_id: &str, path: &Path, offset: u64, line: String);
}

/// Drops every line.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl LineSink for DiscardSink {
    fn emit(&self, _input_id: &str, _path: &Path, _offset: u64, _line: String) {}
}

/// Keeps every emitted line in memory.
#[cfg(test)]
#[derive(Default)]
pub struct CollectingSink {
    lines: std::sync::Mutex<Vec<(String, u64, String)>>,
}

#[cfg(test)]
impl CollectingSink {
    /// `(input_id, offset, line)` in emission order
    pub fn lines(&self) -> Vec<(String, u64, String)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.lines().into_iter().map(|(_, _, line)| line).collect()
    }
}

#[cfg(test)]
impl LineSink for CollectingSink {
    fn emit(&self, input_id: &str, _path: &Path, offset: u64, line: String) {
        self.lines
            .lock()
            .unwrap()
            .push((input_id.to_string(), offset, line));
    }
}
