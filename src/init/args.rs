// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Configuration file (YAML, TOML or JSON, chosen by extension)
    #[arg(long, env = "FILESTREAM_CONFIG")]
    pub config: PathBuf,

    /// Registry directory, overrides `registry.path` from the configuration file
    #[arg(long, env = "FILESTREAM_REGISTRY_PATH")]
    pub registry_path: Option<PathBuf>,

    /// Discovery events buffered between each scanner and its controller
    #[arg(long, env = "FILESTREAM_EVENT_QUEUE_SIZE", default_value = "1000")]
    pub event_queue_size: usize,
}

#[derive(Debug, Args, Clone)]
pub struct ValidateArgs {
    /// Configuration file (YAML, TOML or JSON, chosen by extension)
    #[arg(long, env = "FILESTREAM_CONFIG")]
    pub config: PathBuf,
}
