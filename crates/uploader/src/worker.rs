//! Upload Worker - Serial Upload Queue
//!
//! A single thread drains one unbounded FIFO of [`WorkerMessage`]s. Each
//! `QueueUpload` is processed to completion, upload included, before the next
//! message is looked at, so uploads never overlap.
//!
//! # Shutdown
//!
//! - `terminate()` enqueues a `Terminate` behind everything already queued:
//!   the worker drains, then stops. Anything queued after it is never seen.
//! - `abandon()` raises a flag checked before each message: the in-flight
//!   upload (if any) finishes, everything still queued is dropped.
//!
//! There is no timeout on the upload call. A hung strategy stalls the queue.

use crate::cache::{CacheHandle, FileStatus};
use crate::decision::{decide, Decision, Observation};
use crate::error::WorkerError;
use crate::strategy::UploadStrategy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use url::Url;

/// Messages understood by the worker.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    QueueUpload { path: PathBuf, destination: Url },
    Terminate,
}

/// Counters reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// `QueueUpload` messages taken off the queue and evaluated.
    pub processed: u64,
    /// Uploads the strategy reported as successful.
    pub uploaded: u64,
    pub skipped: u64,
    /// Strategy failures plus requests that could not be evaluated.
    pub failed: u64,
    /// `QueueUpload` messages dropped by `abandon()`.
    pub abandoned: u64,
}

/// Flag raised by `abandon()`. Clone is cheap and shares state.
#[derive(Debug, Clone, Default)]
struct AbandonSignal {
    raised: Arc<AtomicBool>,
}

impl AbandonSignal {
    fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Handle for feeding the worker from any thread.
///
/// Sends are fire-and-forget. Messages from one thread are processed in the
/// order sent; there is no ordering across threads.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: Sender<WorkerMessage>,
    abandon: AbandonSignal,
}

impl WorkerHandle {
    /// Ask for `path` to be considered for upload to `destination`.
    pub fn queue_upload(&self, path: impl Into<PathBuf>, destination: Url) -> Result<(), WorkerError> {
        let path = path.into();
        debug!("Queueing {} for {}", path.display(), destination);
        self.tx
            .send(WorkerMessage::QueueUpload { path, destination })
            .map_err(|_| WorkerError::Closed)
    }

    /// Stop after everything queued so far has been processed.
    pub fn terminate(&self) -> Result<(), WorkerError> {
        self.tx
            .send(WorkerMessage::Terminate)
            .map_err(|_| WorkerError::Closed)
    }

    /// Stop as soon as the in-flight upload finishes, dropping the queue.
    pub fn abandon(&self) {
        self.abandon.raise();
        // Wakes a worker blocked on an empty queue.
        let _ = self.tx.send(WorkerMessage::Terminate);
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("channel", &"<std::sync::mpsc::Sender>")
            .field("abandoned", &self.abandon.is_raised())
            .finish()
    }
}

/// The worker: consumes the queue, consults the cache, calls the strategy.
pub struct UploadWorker {
    rx: Receiver<WorkerMessage>,
    cache: CacheHandle,
    strategy: Arc<dyn UploadStrategy>,
    abandon: AbandonSignal,
}

impl UploadWorker {
    /// Create a worker and its handle. Nothing runs until `spawn`.
    pub fn new(cache: CacheHandle, strategy: Arc<dyn UploadStrategy>) -> (Self, WorkerHandle) {
        let (tx, rx) = mpsc::channel();
        let abandon = AbandonSignal::default();
        let handle = WorkerHandle {
            tx,
            abandon: abandon.clone(),
        };
        let worker = Self {
            rx,
            cache,
            strategy,
            abandon,
        };
        (worker, handle)
    }

    /// Spawn the worker loop in a dedicated thread.
    pub fn spawn(self) -> Result<JoinHandle<WorkerStats>, WorkerError> {
        thread::Builder::new()
            .name("uploader-worker".to_string())
            .spawn(move || self.run_loop())
            .map_err(WorkerError::Spawn)
    }

    /// Run the worker loop on the current thread until Terminate, abandon,
    /// or every handle is dropped.
    pub fn run_loop(self) -> WorkerStats {
        info!("Upload worker started");
        let mut stats = WorkerStats::default();

        while let Ok(message) = self.rx.recv() {
            if self.abandon.is_raised() {
                stats.abandoned = std::iter::once(message)
                    .chain(self.rx.try_iter())
                    .filter(|m| matches!(m, WorkerMessage::QueueUpload { .. }))
                    .count() as u64;
                warn!("Upload worker abandoned with {} uploads still queued", stats.abandoned);
                break;
            }

            match message {
                WorkerMessage::QueueUpload { path, destination } => {
                    self.process(&path, &destination, &mut stats);
                }
                WorkerMessage::Terminate => {
                    info!("Upload worker received terminate");
                    break;
                }
            }
        }

        info!(
            processed = stats.processed,
            uploaded = stats.uploaded,
            skipped = stats.skipped,
            failed = stats.failed,
            abandoned = stats.abandoned,
            "Upload worker stopped"
        );
        stats
    }

    /// Evaluate one request and upload if the rules say so.
    fn process(&self, path: &Path, destination: &Url, stats: &mut WorkerStats) {
        let request = short_request_id();
        stats.processed += 1;

        let observation = match Observation::of_path(path) {
            Ok(observation) => observation,
            Err(err) => {
                error!("{}: Cannot stat {}: {}", request, path.display(), err);
                stats.failed += 1;
                return;
            }
        };

        // A missing file is skipped whatever the cache holds.
        let status = match observation {
            Observation::Missing => FileStatus::default(),
            Observation::Present { .. } => match self.cache.file_status(path) {
                Ok(status) => status,
                Err(err) => {
                    error!("{}: Cannot look up {}: {}", request, path.display(), err);
                    stats.failed += 1;
                    return;
                }
            },
        };

        let reason = match decide(&status, observation) {
            Decision::Skip(reason) => {
                info!("{}: Not uploading {} because {}", request, path.display(), reason);
                stats.skipped += 1;
                return;
            }
            Decision::Upload(reason) => reason,
        };

        info!(
            "{}: Uploading {} to {} because {}",
            request,
            path.display(),
            destination,
            reason
        );
        let timestamp = match self.strategy.upload(path, destination) {
            Ok(timestamp) => timestamp,
            Err(err) => {
                // Left untouched in the cache; the next enqueue re-evaluates it.
                error!("{}: Upload of {} failed: {}", request, path.display(), err);
                stats.failed += 1;
                return;
            }
        };
        stats.uploaded += 1;

        if let Err(err) = self.cache.record_upload(path, timestamp) {
            error!(
                "{}: Uploaded {} but could not record it: {}",
                request,
                path.display(),
                err
            );
        }
    }
}

fn short_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
