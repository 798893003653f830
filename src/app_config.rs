//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Tier roots and the mount point
//! are given on the command line; everything else has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use hycache::fs::{FsOptions, MkdirPolicy};
use hycache::mirror::{MirrorQueue, MirrorWorkerConfig};
use hycache::tiering::{FlushPolicy, QueueOrder};

/// Persistence of the tiering queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TieringConfig {
    /// Which end of the priority range is served first.
    #[serde(default)]
    pub order: QueueOrder,

    /// When mutations are written to the snapshot file.
    #[serde(default)]
    pub flush: FlushPolicy,
}

fn default_max_attempts() -> u32 {
    MirrorWorkerConfig::default().max_attempts
}

fn default_initial_backoff_ms() -> u64 {
    duration_ms(MirrorWorkerConfig::default().initial_backoff)
}

fn default_max_backoff_ms() -> u64 {
    duration_ms(MirrorWorkerConfig::default().max_backoff)
}

fn default_warn_depth() -> usize {
    MirrorQueue::DEFAULT_WARN_DEPTH
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Retry behavior of the slow-tier mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorConfig {
    /// Attempts per operation before it is put back at the head of the queue.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound of the retry delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Queue depth at which a backlog warning is logged.
    #[serde(default = "default_warn_depth")]
    pub warn_depth: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            warn_depth: default_warn_depth(),
        }
    }
}

impl MirrorConfig {
    pub fn worker_config(&self) -> MirrorWorkerConfig {
        MirrorWorkerConfig {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub tiering: TieringConfig,

    #[serde(default)]
    pub mirror: MirrorConfig,

    /// What `mkdir` does for a directory that already exists with the requested mode.
    #[serde(default)]
    pub mkdir_policy: MkdirPolicy,

    /// Let users other than the one mounting access the filesystem.
    #[serde(default)]
    pub allow_other: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Failed to parse {path}: {source}")]
    DeserializationError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to read {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every problem at once rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.mirror.max_attempts == 0 {
            errors.push("mirror.max-attempts must be at least 1.".to_owned());
        }

        if self.mirror.max_backoff_ms == 0 {
            errors.push("mirror.max-backoff-ms must be greater than 0.".to_owned());
        }

        if self.mirror.initial_backoff_ms > self.mirror.max_backoff_ms {
            errors.push(format!(
                "mirror.initial-backoff-ms ({}) exceeds mirror.max-backoff-ms ({}).",
                self.mirror.initial_backoff_ms, self.mirror.max_backoff_ms
            ));
        }

        if self.mirror.warn_depth == 0 {
            errors.push("mirror.warn-depth must be at least 1.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn fs_options(&self) -> FsOptions {
        FsOptions {
            queue_order: self.tiering.order,
            flush_policy: self.tiering.flush,
            mkdir_policy: self.mkdir_policy,
        }
    }

    /// Returns config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("hycache").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            let path = home.join(".config").join("hycache").join("config.toml");
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        paths.push(PathBuf::from("/etc/hycache/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::DeserializationError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Loads and validates the configuration.
    ///
    /// An explicit path must exist. Without one, the first file found on the search paths is
    /// used, and the defaults apply if there is none.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file)
        {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                debug!("No configuration file found, using defaults.");
                Self::default()
            }
        };

        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}
