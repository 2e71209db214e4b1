//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Thread group that catalog tests run on when they name none.
pub const DEFAULT_THREAD_GROUP: &str = "__tests__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinionConfig {
    pub name: String,
    /// `host:port` of the minion's RPC listener.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KartaConfig {
    pub default_feature_source_parser_plugin: Option<String>,
    pub default_step_runner_plugin: Option<String>,
    pub default_test_data_source_plugins: Vec<String>,
    /// Empty enables every registered plugin.
    pub enabled_plugins: Vec<String>,
    pub test_thread_count: usize,
    pub thread_groups: HashMap<String, usize>,
    pub minions_enabled: bool,
    pub minions: Vec<MinionConfig>,
    pub random_seed: Option<u64>,
    pub log_filter: Option<String>,
    pub event_log_dir: Option<PathBuf>,
    /// Per-plugin property tables, keyed by plugin name.
    pub plugins: HashMap<String, toml::Table>,
}

impl Default for KartaConfig {
    fn default() -> Self {
        Self {
            default_feature_source_parser_plugin: None,
            default_step_runner_plugin: None,
            default_test_data_source_plugins: Vec::new(),
            enabled_plugins: Vec::new(),
            test_thread_count: 4,
            thread_groups: HashMap::new(),
            minions_enabled: false,
            minions: Vec::new(),
            random_seed: None,
            log_filter: None,
            event_log_dir: None,
            plugins: HashMap::new(),
        }
    }
}

impl KartaConfig {
    pub fn plugin_properties(&self, plugin: &str) -> toml::Table {
        self.plugins.get(plugin).cloned().unwrap_or_default()
    }

    /// Configured size for a named thread group, falling back to the test thread count.
    pub fn thread_group_size(&self, group: &str) -> usize {
        self.thread_groups
            .get(group)
            .copied()
            .unwrap_or(self.test_thread_count)
    }
}

pub fn parse_karta_config(contents: &str) -> Result<KartaConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_karta_config(path: impl AsRef<Path>) -> Result<KartaConfig, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_karta_config(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
