//! Uploader Service - Routing Front End for the Upload Worker
//!
//! Owns the worker thread and the router. `queue_upload(path)` asks the router
//! for destinations and enqueues one request per destination; an empty route
//! is a no-op, not an error.

use crate::cache::CacheHandle;
use crate::error::WorkerError;
use crate::strategy::{Router, UploadStrategy};
use crate::worker::{UploadWorker, WorkerHandle, WorkerStats};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};
use url::Url;

pub struct UploaderService {
    worker: WorkerHandle,
    router: Arc<dyn Router>,
    thread: Option<JoinHandle<WorkerStats>>,
    stats: Option<WorkerStats>,
}

impl UploaderService {
    /// Start a worker thread fed by this service.
    pub fn start(
        cache: CacheHandle,
        router: impl Router + 'static,
        strategy: impl UploadStrategy + 'static,
    ) -> Result<Self, WorkerError> {
        let (worker, handle) = UploadWorker::new(cache, Arc::new(strategy));
        let thread = worker.spawn()?;
        Ok(Self {
            worker: handle,
            router: Arc::new(router),
            thread: Some(thread),
            stats: None,
        })
    }

    /// Queue `path` for every destination the router gives it.
    ///
    /// Returns how many requests were queued.
    pub fn queue_upload(&self, path: impl AsRef<Path>) -> Result<usize, WorkerError> {
        let path = path.as_ref();
        let destinations = self.router.route(path);
        if destinations.is_empty() {
            debug!("No destinations for {}", path.display());
            return Ok(0);
        }

        let count = destinations.len();
        for destination in destinations {
            self.worker.queue_upload(path, destination)?;
        }
        Ok(count)
    }

    /// Queue `path` for an explicit destination, bypassing the router.
    pub fn queue_upload_to(&self, path: impl AsRef<Path>, destination: Url) -> Result<(), WorkerError> {
        self.worker.queue_upload(path.as_ref(), destination)
    }

    /// A handle producers on other threads can queue through.
    pub fn handle(&self) -> WorkerHandle {
        self.worker.clone()
    }

    /// Finish everything queued so far, then stop.
    pub fn terminate(&self) -> Result<(), WorkerError> {
        self.worker.terminate()
    }

    /// Wait for the worker to stop and return what it did.
    ///
    /// Blocks forever unless `terminate`, `abandon` or `close` is called.
    pub fn await_termination(&mut self) -> WorkerStats {
        if let Some(thread) = self.thread.take() {
            let stats = match thread.join() {
                Ok(stats) => stats,
                Err(_) => {
                    error!("Upload worker thread panicked");
                    WorkerStats::default()
                }
            };
            self.stats = Some(stats);
        }
        self.stats.unwrap_or_default()
    }

    /// Stop as soon as possible, dropping queued uploads, and wait.
    pub fn close(mut self) -> WorkerStats {
        self.worker.abandon();
        self.await_termination()
    }
}

impl Drop for UploaderService {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.worker.abandon();
            self.await_termination();
        }
    }
}

impl std::fmt::Debug for UploaderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploaderService")
            .field("worker", &self.worker)
            .field("running", &self.thread.is_some())
            .finish()
    }
}
