//! I/O core configuration.
//!
//! Loaded from RON, for example:
//!
//! ```ron
//! (
//!     strategy: WriteBack,
//!     pool: (storage: Memory),
//!     overflow: (storage: TempFile, temp_dir: Some("/var/tmp"), prefix: "mux-"),
//! )
//! ```
//!
//! Every field is optional and falls back to [`IoConfig::default`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::cache::Strategy;
use super::pool::StorageKind;

/// Default prefix for buffer names and temp files.
pub const DEFAULT_PREFIX: &str = "arcfs-";

/// Settings for one buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Memory or temp files.
    pub storage: StorageKind,
    /// Directory for temp files; the system temp dir if unset.
    pub temp_dir: Option<PathBuf>,
    /// Prefix for buffer names and temp file names.
    pub prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Memory,
            temp_dir: None,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

/// Settings for caches and multiplexers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Consistency strategy for new cache entries.
    pub strategy: Strategy,
    /// Pool backing cache entries.
    pub pool: PoolConfig,
    /// Pool backing multiplexer overflow.
    pub overflow: PoolConfig,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::WriteThrough,
            pool: PoolConfig::default(),
            overflow: PoolConfig {
                storage: StorageKind::TempFile,
                ..PoolConfig::default()
            },
        }
    }
}

impl IoConfig {
    /// Parse configuration from RON text.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Load configuration from a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}
