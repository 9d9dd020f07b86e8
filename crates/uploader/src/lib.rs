//! Uploader - Decide Which Local Files Need Pushing
//!
//! Tracks per-file upload history plus two path-pattern policies, *ignore*
//! and *freeze*, and gates uploads on them.
//!
//! # Architecture
//!
//! ```text
//!  producers ──queue_upload(path)──▶ UploaderService ──route──▶ Router
//!                                         │
//!                                         │ QueueUpload{path, destination}
//!                                         ▼
//!                              ┌──────────────────────┐
//!                              │ UploadWorker thread  │──upload──▶ UploadStrategy
//!                              │  (one FIFO, serial)  │
//!                              └──────────────────────┘
//!                                 │ file_status / record_upload
//!                                 ▼
//!                              ┌──────────────────────┐
//!                              │ Cache actor thread   │──save──▶ cache.json
//!                              │  owns CacheStore     │
//!                              └──────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! 1. **Two single-owner actors**: the cache actor owns all tracking state,
//!    the worker owns the queue. Nothing is shared by reference.
//! 2. **Pure decisions**: [`decide`] maps cached status plus one stat of the
//!    file to Upload/Skip with a reason; it does no I/O.
//! 3. **No retries**: a failed upload leaves the cache untouched and the file
//!    is re-evaluated the next time someone queues it.
//! 4. **Injected transport**: bytes move through an [`UploadStrategy`],
//!    destinations come from a [`Router`].

pub mod cache;
pub mod config;
pub mod decision;
pub mod error;
pub mod paths;
pub mod service;
pub mod strategy;
pub mod worker;

pub use cache::{
    spawn_cache, CacheHandle, CacheStore, FileStatus, FreezeRule, PathPattern, UploaderCache,
};
pub use config::UploaderConfig;
pub use decision::{decide, Decision, Observation, SkipReason, UploadReason};
pub use error::{CacheError, CacheResult, ConfigError, UploadError, WorkerError};
pub use paths::{normalize_path, EpochMillis};
pub use service::UploaderService;
pub use strategy::{MirrorRouter, MirrorStrategy, Router, StaticRouter, UploadStrategy};
pub use worker::{UploadWorker, WorkerHandle, WorkerMessage, WorkerStats};
