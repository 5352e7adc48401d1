// SPDX-License-Identifier: Apache-2.0

use glob::{Pattern, glob};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use crate::receivers::file::error::{Error, Result};

/// Discovers candidate files for an input.
pub trait FileFinder: Send {
    /// Find all files currently matching the input's patterns.
    fn find_files(&self) -> Result<Vec<PathBuf>>;
}

/// GlobFileFinder finds files matching include patterns while excluding others
#[derive(Debug, Clone)]
pub struct GlobFileFinder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl GlobFileFinder {
    /// Create a new finder, rejecting malformed include or exclude patterns up front.
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self> {
        for pattern in &include {
            Pattern::new(pattern)
                .map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
        }

        let exclude = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { include, exclude })
    }

    fn is_excluded(&self, path: &std::path::Path) -> bool {
        self.exclude.iter().any(|p| p.matches_path(path))
    }
}

impl FileFinder for GlobFileFinder {
    /// Paths matched by several include patterns are returned once.
    fn find_files(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = glob(pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        // Unreadable directory entries are retried on the next scan
                        debug!("Skipping unreadable glob entry: {}", e);
                        continue;
                    }
                };

                if path.is_dir() || self.is_excluded(&path) {
                    continue;
                }

                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        Ok(paths)
    }
}

/// Finder returning a fixed list of paths, or failing on demand.
#[cfg(test)]
pub struct MockFileFinder {
    pub paths: Vec<PathBuf>,
    pub fail: bool,
}

#[cfg(test)]
impl FileFinder for MockFileFinder {
    fn find_files(&self) -> Result<Vec<PathBuf>> {
        if self.fail {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "mock finder failure",
            )));
        }
        Ok(self.paths.clone())
    }
}
