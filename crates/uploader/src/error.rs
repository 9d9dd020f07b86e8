//! Error types for the uploader.
//!
//! Nothing here crosses an actor boundary as a panic: cache failures travel
//! back in the reply, worker-side failures are logged.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Cache operation result type.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors reported by the cache store and the cache actor.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache document could not be read or written. When this comes back
    /// from a mutating command the in-memory change has still been applied.
    #[error("Failed to persist cache {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A non-empty cache document exists but cannot be parsed.
    #[error("Malformed cache document {}: {source}", .path.display())]
    MalformedStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A pattern failed to compile as a regular expression.
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The cache actor thread could not be started.
    #[error("Failed to spawn cache actor: {0}")]
    Spawn(#[source] io::Error),

    /// The cache actor has stopped and no longer answers.
    #[error("Cache actor is not running")]
    ActorUnavailable,
}

impl CacheError {
    /// True if the failure only concerns durability of an applied change.
    pub fn is_persistence(&self) -> bool {
        matches!(self, CacheError::Persistence { .. })
    }
}

/// Failures reported by an [`UploadStrategy`](crate::UploadStrategy).
#[derive(Debug, Error)]
pub enum UploadError {
    /// Reading the source or writing the destination failed.
    #[error("Upload I/O error: {0}")]
    Io(#[from] io::Error),

    /// The strategy cannot deliver to this destination.
    #[error("Unsupported destination: {0}")]
    Destination(String),
}

/// Errors from the upload worker's handle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker loop has exited; the message was not queued.
    #[error("Upload worker is not running")]
    Closed,

    /// The worker thread could not be started.
    #[error("Failed to spawn upload worker: {0}")]
    Spawn(#[source] io::Error),
}

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
