//! Command types for cache actor message passing
//!
//! Commands are sent from [`CacheHandle`](super::CacheHandle) to the actor
//! thread. Each command carries a Responder channel for the reply.

use super::store::{CacheStore, FileStatus, PathPattern};
use crate::error::CacheResult;
use crate::paths::EpochMillis;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

/// One-shot channel for returning results from the actor
pub type Responder<T> = Sender<T>;

/// Commands sent to the cache actor
#[derive(Debug)]
pub enum Command {
    // ========================================================================
    // Mutations (persisted before the reply)
    // ========================================================================
    /// Add a freeze rule, then snapshot matching mtimes under `root`
    Freeze {
        root: PathBuf,
        pattern: PathPattern,
        deadline: EpochMillis,
        respond: Responder<CacheResult<()>>,
    },

    /// Add an ignore pattern
    Ignore {
        pattern: PathPattern,
        respond: Responder<CacheResult<()>>,
    },

    /// Record a successful upload
    RecordUpload {
        path: PathBuf,
        timestamp: EpochMillis,
        respond: Responder<CacheResult<()>>,
    },

    // ========================================================================
    // Queries
    // ========================================================================
    /// Derived status for one path
    QueryFileStatus {
        path: PathBuf,
        respond: Responder<FileStatus>,
    },

    /// Full copy of the store
    QuerySnapshot { respond: Responder<CacheStore> },

    // ========================================================================
    // Control
    // ========================================================================
    /// Reply, then stop the actor loop
    Terminate { respond: Responder<()> },
}
