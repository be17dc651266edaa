//! Filesystem configuration.
//!
//! Loaded from TOML; every key is optional:
//!
//! ```toml
//! block_size = 67108864
//! cache_max_blocks = 256
//! signature_ttl_secs = 1209600
//! backend_timeout_secs = 300
//! project_refresh_secs = 30
//! debug_locks = false
//! default_storage_classes = ["default"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunables for collection and site filesystems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Max bytes packed into one block on sync.
    pub block_size: usize,
    /// Capacity of the shared block cache.
    pub cache_max_blocks: usize,
    /// TTL requested when re-signing a locator.
    pub signature_ttl_secs: u64,
    /// Deadline for each backend call.
    pub backend_timeout_secs: u64,
    /// How long a project listing is reused before refetching.
    pub project_refresh_secs: u64,
    /// Panic on lock discipline violations.
    pub debug_locks: bool,
    /// Storage classes used when a collection names none.
    pub default_storage_classes: Vec<String>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            block_size: 64 << 20,
            cache_max_blocks: 256,
            signature_ttl_secs: 14 * 24 * 3600,
            backend_timeout_secs: 300,
            project_refresh_secs: 30,
            debug_locks: false,
            default_storage_classes: vec!["default".to_string()],
        }
    }
}

impl FsConfig {
    /// Parse TOML text.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: FsConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// `<config dir>/collfs/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("collfs").join("config.toml"))
    }

    /// Load the default config file if it exists, else defaults.
    pub fn load_default() -> ConfigResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be positive".into()));
        }
        if self.backend_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn signature_ttl(&self) -> Duration {
        Duration::from_secs(self.signature_ttl_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    pub fn project_refresh(&self) -> Duration {
        Duration::from_secs(self.project_refresh_secs)
    }
}
