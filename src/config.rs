//! Configuration loading.
//!
//! Configuration is layered TOML: the user file, then the project file, then
//! an explicit `--config` path. Layers are merged as TOML tables before
//! deserialisation, so a key absent from every layer falls through to its
//! `default_*` provider rather than to the zero value of its type.

use crate::health::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(#[source] toml::de::Error),

    /// A numeric field resolved to zero without the user writing it.
    /// Always a loader bug: some field lost its default provider.
    #[error("config field `{field}` resolved to zero but was never set")]
    DefaultMissing { field: &'static str },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub terminal: TerminalConfig,
    pub agent: AgentConfig,
    pub inbox: InboxConfig,
}

/// Terminal and spawn-timing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Preferred terminal program (e.g. "ghostty").
    #[serde(alias = "preferred_terminal", skip_serializing_if = "Option::is_none")]
    pub preferred: Option<String>,

    /// Delay between PID-file checks after a spawn, in milliseconds.
    #[serde(default = "default_spawn_delay_ms")]
    pub spawn_delay_ms: u64,

    /// How many times to look for the PID file before giving up.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
}

/// Per-agent settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent used when a spawn does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Launch command overrides, keyed by agent name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, String>,
}

/// Inbox retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Messages older than this are dropped by `prune`.
    #[serde(default = "default_inbox_max_age_secs")]
    pub max_age_secs: u64,
}

pub const fn default_spawn_delay_ms() -> u64 {
    1000
}

pub const fn default_max_retry_attempts() -> u32 {
    5
}

pub const fn default_inbox_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            preferred: None,
            spawn_delay_ms: default_spawn_delay_ms(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_inbox_max_age_secs(),
        }
    }
}

impl TerminalConfig {
    /// Retry policy for PID-file health checks.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            delay: Duration::from_millis(self.spawn_delay_ms),
        }
    }
}

impl InboxConfig {
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Config {
    /// Load the user and project layers, plus `explicit` if given.
    ///
    /// Missing user/project files are skipped; a missing explicit file is an
    /// error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        for path in [user_config_path(), Some(project_config_path())]
            .into_iter()
            .flatten()
        {
            if path.is_file() {
                layers.push(read_layer(&path)?);
            }
        }
        if let Some(path) = explicit {
            layers.push(read_layer(path)?);
        }
        Self::from_layers(layers)
    }

    /// Parse a single TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = s.parse().map_err(ConfigError::Invalid)?;
        Self::from_layers(vec![table])
    }

    fn from_layers(layers: Vec<toml::Table>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for layer in layers {
            merge_tables(&mut merged, layer);
        }

        let config: Self = toml::Value::Table(merged.clone())
            .try_into()
            .map_err(ConfigError::Invalid)?;

        config.check_defaults(&merged)?;
        if config.terminal.max_retry_attempts == 0 {
            warn!("terminal.max_retry_attempts is 0; health checks will make a single attempt");
        }
        debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Reject zero retry/delay values that the user never wrote.
    fn check_defaults(&self, merged: &toml::Table) -> Result<(), ConfigError> {
        let terminal = merged.get("terminal").and_then(toml::Value::as_table);
        let set = |key: &str| terminal.is_some_and(|t| t.contains_key(key));

        if self.terminal.spawn_delay_ms == 0 && !set("spawn_delay_ms") {
            return Err(ConfigError::DefaultMissing {
                field: "terminal.spawn_delay_ms",
            });
        }
        if self.terminal.max_retry_attempts == 0 && !set("max_retry_attempts") {
            return Err(ConfigError::DefaultMissing {
                field: "terminal.max_retry_attempts",
            });
        }
        Ok(())
    }

    /// Render the resolved configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

fn read_layer(path: &Path) -> Result<toml::Table, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "Read config layer");
    text.parse().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Recursively merge `overlay` into `base`; overlay wins on conflicts.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// `$XDG_CONFIG_HOME/corral/config.toml`.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("corral").join("config.toml"))
}

/// `./.corral/config.toml`.
#[must_use]
pub fn project_config_path() -> PathBuf {
    PathBuf::from(".corral").join("config.toml")
}
