// SPDX-License-Identifier: Apache-2.0

use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::BoxError;
use crate::init::args::AgentRun;
use crate::receivers::file::config::{InputDefinition, RegistryConfig};

/// Prefix of environment variables that override configuration file keys.
/// Nested keys are separated by a double underscore, e.g.
/// `FILESTREAM_REGISTRY__CLEANUP_INTERVAL=30s`.
pub const ENV_PREFIX: &str = "FILESTREAM_";

// Flag env vars share the prefix but are not configuration keys
const FLAG_ENV_KEYS: &[&str] = &["config", "registry_path", "event_queue_size", "log_format"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,

    #[serde(default)]
    pub registry: RegistryConfig,
}

impl AgentConfig {
    pub fn with_registry_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.registry.path = path;
        }
        self
    }
}

/// Load the configuration named by the start flags, applying flag overrides.
pub fn get_agent_config(args: &AgentRun) -> Result<AgentConfig, BoxError> {
    let config = load_config(&args.config)?;
    Ok(config.with_registry_path(args.registry_path.clone()))
}

/// Load a configuration file, with `FILESTREAM_` environment overrides.
pub fn load_config(path: &Path) -> Result<AgentConfig, BoxError> {
    load_config_with_env(path, ENV_PREFIX)
}

fn load_config_with_env(path: &Path, env_prefix: &str) -> Result<AgentConfig, BoxError> {
    if !path.is_file() {
        return Err(format!("configuration file not found: {}", path.display()).into());
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    let figment = match extension.as_deref() {
        Some("yml") | Some("yaml") => Figment::from(Yaml::file_exact(path)),
        Some("toml") => Figment::from(Toml::file_exact(path)),
        Some("json") => Figment::from(Json::file_exact(path)),
        _ => {
            return Err(format!(
                "unsupported configuration file extension, expected yml, yaml, toml or json: {}",
                path.display()
            )
            .into());
        }
    };

    let figment = figment.merge(Env::prefixed(env_prefix).split("__").ignore(FLAG_ENV_KEYS));

    match figment.extract() {
        Ok(config) => Ok(config),
        Err(e) => Err(format!("failed to parse configuration {}: {}", path.display(), e).into()),
    }
}
