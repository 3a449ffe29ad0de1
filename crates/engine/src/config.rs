//! Access layer configuration via `custodian.toml`
//!
//! Everything that can be expressed as plain data lives here. Code-level
//! options (schema, migrations, metrics sink, engine) go through
//! [`AccessBuilder`](crate::AccessBuilder).

use std::path::{Path, PathBuf};
use std::time::Duration;

use custodian_core::{AccessError, AccessResult};
use serde::{Deserialize, Serialize};

/// Config file name placed next to the store file.
pub const CONFIG_FILE_NAME: &str = "custodian.toml";

/// Extension appended to the store filename when it has none.
pub const STORE_EXTENSION: &str = "store";

/// Access layer configuration loaded from `custodian.toml`.
///
/// # Example
///
/// ```toml
/// directory = "/var/lib/app"
/// filename = "client"
/// versioned_filename = false
/// async_workers = 2
/// # max_short_lived_handles = 8
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Directory holding the store file and its backups.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Store filename; `.store` is appended when it has no extension.
    #[serde(default = "default_filename")]
    pub filename: String,
    /// Append the schema version to the filename (`{base}_{version}{ext}`).
    #[serde(default)]
    pub versioned_filename: bool,
    /// Name of the owning thread.
    #[serde(default = "default_owner_thread_name")]
    pub owner_thread_name: String,
    /// Worker threads serving asynchronous reads and writes.
    #[serde(default = "default_async_workers")]
    pub async_workers: usize,
    /// Upper bound on concurrently open short-lived handles (unbounded when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_short_lived_handles: Option<usize>,
    /// Sleep between compaction attempts.
    #[serde(default = "default_compact_retry_interval_ms")]
    pub compact_retry_interval_ms: u64,
    /// Wall-clock budget for compaction retries.
    #[serde(default = "default_compact_budget_ms")]
    pub compact_budget_ms: u64,
    /// Bound on re-establishing the owning handle after a blocking window.
    #[serde(default = "default_restore_timeout_ms")]
    pub restore_timeout_ms: u64,
    /// Bound on waiting for in-flight asynchronous operations at dispose.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_filename() -> String {
    "custodian".to_string()
}

fn default_owner_thread_name() -> String {
    "custodian-owner".to_string()
}

fn default_async_workers() -> usize {
    2
}

fn default_compact_retry_interval_ms() -> u64 {
    200
}

fn default_compact_budget_ms() -> u64 {
    5000
}

fn default_restore_timeout_ms() -> u64 {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            filename: default_filename(),
            versioned_filename: false,
            owner_thread_name: default_owner_thread_name(),
            async_workers: default_async_workers(),
            max_short_lived_handles: None,
            compact_retry_interval_ms: default_compact_retry_interval_ms(),
            compact_budget_ms: default_compact_budget_ms(),
            restore_timeout_ms: default_restore_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl AccessConfig {
    /// Default configuration storing `filename` in `directory`.
    pub fn new(directory: impl Into<PathBuf>, filename: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            filename: filename.into(),
            ..Self::default()
        }
    }

    /// Store filename with the default extension applied.
    pub fn store_filename(&self) -> String {
        if Path::new(&self.filename).extension().is_some() {
            self.filename.clone()
        } else {
            format!("{}.{}", self.filename, STORE_EXTENSION)
        }
    }

    /// Sleep between compaction attempts.
    pub fn compact_retry_interval(&self) -> Duration {
        Duration::from_millis(self.compact_retry_interval_ms)
    }

    /// Compaction retry budget.
    pub fn compact_budget(&self) -> Duration {
        Duration::from_millis(self.compact_budget_ms)
    }

    /// Restore bound after a blocking window.
    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }

    /// Drain bound at dispose.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Check values that would make the layer unusable.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Config`] for an empty filename, zero workers or
    /// a zero handle bound.
    pub fn validate(&self) -> AccessResult<()> {
        if self.filename.trim().is_empty() {
            return Err(AccessError::config("filename must not be empty"));
        }
        if self.async_workers == 0 {
            return Err(AccessError::config("async_workers must be at least 1"));
        }
        if self.max_short_lived_handles == Some(0) {
            return Err(AccessError::config(
                "max_short_lived_handles must be at least 1 when set",
            ));
        }
        if self.owner_thread_name.is_empty() {
            return Err(AccessError::config("owner_thread_name must not be empty"));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Custodian store access configuration
#
# Directory holding the store file and its backups
directory = "."

# Store filename; ".store" is appended when it has no extension
filename = "custodian"

# Append the schema version to the filename ("custodian_3.store").
# On first run of a new version the newest older file is copied forward.
versioned_filename = false

# Name of the owning thread
owner_thread_name = "custodian-owner"

# Worker threads serving asynchronous reads and writes
async_workers = 2

# Upper bound on concurrently open short-lived handles (default: unbounded)
# max_short_lived_handles = 8

# Compaction retry loop: sleep between attempts and total budget
compact_retry_interval_ms = 200
compact_budget_ms = 5000

# Bound on re-establishing the owning handle after a blocking window
restore_timeout_ms = 10000

# Bound on waiting for in-flight asynchronous operations at dispose
drain_timeout_ms = 10000
"#
    }

    /// Parse config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or fails validation.
    pub fn from_toml_str(content: &str) -> AccessResult<Self> {
        let config: AccessConfig = toml::from_str(content)
            .map_err(|e| AccessError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> AccessResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AccessError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            AccessError::Config(msg) => {
                AccessError::config(format!("{} (in '{}')", msg, path.display()))
            }
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> AccessResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> AccessResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AccessError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
