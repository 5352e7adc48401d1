// SPDX-License-Identifier: Apache-2.0

mod file_id;
mod finder;
mod reader;

pub use file_id::FileId;
#[cfg(test)]
pub use finder::MockFileFinder;
pub use finder::{FileFinder, GlobFileFinder};
pub use reader::{FileReader, ReadSummary};
