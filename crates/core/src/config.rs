//! Database configuration
//!
//! `DbConfig` covers the flush scheduler, the default cache mode, and the
//! filesystem mount step. All fields have serde defaults so a partial TOML
//! document (or an empty one) loads cleanly.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_base_dir() -> String {
    "/db".to_string()
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_max_open_files() -> u16 {
    10
}

fn default_stack_size() -> usize {
    128 * 1024
}

fn default_priority() -> u8 {
    2
}

/// Database configuration.
///
/// # Example
///
/// ```
/// use packdb_core::DbConfig;
///
/// let cfg = DbConfig {
///     interval_ms: 500,
///     autosync: false,
///     ..DbConfig::default()
/// };
/// assert_eq!(cfg.base_dir, "/db");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Virtual base directory for all collections. Normalized on open:
    /// leading `/`, no trailing `/`, empty becomes `/db`.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// Period of the background flush task, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Whether the background flush task runs.
    #[serde(default = "default_true")]
    pub autosync: bool,

    /// On open, eagerly load every collection found on disk.
    #[serde(default)]
    pub cold_sync: bool,

    /// Default cache mode for new collections; propagated to live
    /// collections by `change_config`.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Mount the backing filesystem on open. Disable when an
    /// externally-owned filesystem handle is supplied.
    #[serde(default = "default_true")]
    pub init_file_system: bool,

    /// Reformat (wipe) the mount root when mounting fails.
    #[serde(default)]
    pub format_on_fail: bool,

    /// Passed to the filesystem mount; advisory on a host OS.
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u16,

    /// Passed to the filesystem mount; advisory on a host OS.
    #[serde(default)]
    pub partition_label: Option<String>,

    /// Stack size for the flush task thread, in bytes.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Flush task priority. Carried for diagnostics; a host OS scheduler
    /// does not honor it.
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Flush task core affinity. Carried for diagnostics only.
    #[serde(default)]
    pub core_id: Option<usize>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            base_dir: default_base_dir(),
            interval_ms: default_interval_ms(),
            autosync: true,
            cold_sync: false,
            cache_enabled: true,
            init_file_system: true,
            format_on_fail: false,
            max_open_files: default_max_open_files(),
            partition_label: None,
            stack_size: default_stack_size(),
            priority: default_priority(),
            core_id: None,
        }
    }
}

impl DbConfig {
    /// Parse a config from TOML text. Missing fields use defaults.
    pub fn from_toml_str(s: &str) -> DbResult<Self> {
        toml::from_str(s)
            .map_err(|e| DbError::invalid_argument(format!("failed to parse config: {}", e)))
    }

    /// Read and parse a config file from the host filesystem.
    pub fn from_file(path: &Path) -> DbResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DbError::io(format!("failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Normalize a base directory string: empty becomes `/db`, a leading
    /// `/` is ensured, a trailing `/` is dropped.
    pub fn normalize_base_dir(raw: &str) -> String {
        let mut dir = if raw.is_empty() {
            "/db".to_string()
        } else {
            raw.to_string()
        };
        if !dir.starts_with('/') {
            dir.insert(0, '/');
        }
        while dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }
        dir
    }
}
