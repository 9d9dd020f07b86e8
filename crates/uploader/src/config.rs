//! Configuration for the uploader binary
//!
//! Read from `$UPLOADER_HOME/config.toml` (default `~/.uploader/config.toml`)
//! when present. Command-line flags override individual values.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";
const CACHE_FILE_NAME: &str = "cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Where the cache document lives
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,

    /// Destination root used by `push` when no flag is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_root: Option<PathBuf>,

    /// Print info-level logs to stderr as well as the log file
    #[serde(default)]
    pub verbose: bool,
}

fn default_cache_file() -> PathBuf {
    uploader_logging::uploader_home()
        .map(|home| home.join(CACHE_FILE_NAME))
        .unwrap_or_else(|_| PathBuf::from(CACHE_FILE_NAME))
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            cache_file: default_cache_file(),
            mirror_root: None,
            verbose: false,
        }
    }
}

impl UploaderConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `<home>/config.toml`, if a home directory can be determined.
    pub fn default_path() -> Option<PathBuf> {
        uploader_logging::uploader_home()
            .ok()
            .map(|home| home.join(CONFIG_FILE_NAME))
    }
}
