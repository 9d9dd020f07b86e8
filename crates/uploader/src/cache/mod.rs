//! Cache Actor - Single-Owner Upload State
//!
//! One thread exclusively owns the [`CacheStore`], receiving [`Command`]s
//! over a channel and answering each on its own one-shot channel.
//!
//! # Design Principles
//!
//! 1. **Single owner**: only the actor thread touches the store; callers get
//!    copies (`snapshot`) or derived values (`file_status`)
//! 2. **Message passing**: every read and write is a Command with a reply
//! 3. **Persist before reply**: mutations are written to disk before the
//!    caller hears back; a failed write is reported but not rolled back
//! 4. **No async**: std threads and channels
//!
//! # Lifecycle
//!
//! ```text
//! Created -> Loading -> Serving -> Terminating -> Stopped
//! ```
//!
//! Loading runs inside the actor thread. A load failure (for example a
//! malformed document) is sent back to the spawner and the thread exits
//! without serving.

mod command;
pub mod store;

pub use command::{Command, Responder};
pub use store::{CacheStore, FileStatus, FreezeRule, PathPattern};

use crate::error::{CacheError, CacheResult};
use crate::paths::EpochMillis;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Handle for interacting with the cache actor from other threads.
///
/// Can be cloned and shared. Every call sends a Command and blocks until the
/// actor replies; calls from different threads are serialized by the actor.
#[derive(Clone)]
pub struct CacheHandle {
    cmd_tx: Sender<Command>,
}

impl CacheHandle {
    fn new(cmd_tx: Sender<Command>) -> Self {
        Self { cmd_tx }
    }

    /// Send a command and wait for response
    fn send_and_wait<T>(&self, make_cmd: impl FnOnce(Responder<T>) -> Command) -> CacheResult<T>
    where
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(make_cmd(tx))
            .map_err(|_| CacheError::ActorUnavailable)?;
        rx.recv().map_err(|_| CacheError::ActorUnavailable)
    }

    /// Freeze everything matching `pattern` as of `deadline`.
    ///
    /// Walks `root` before replying, so this blocks for as long as the walk
    /// takes.
    pub fn freeze(&self, root: impl AsRef<Path>, pattern: &str, deadline: EpochMillis) -> CacheResult<()> {
        let pattern = PathPattern::new(pattern)?;
        let root = root.as_ref().to_path_buf();
        self.send_and_wait(|respond| Command::Freeze {
            root,
            pattern,
            deadline,
            respond,
        })?
    }

    /// Never upload paths matching `pattern`.
    pub fn ignore(&self, pattern: &str) -> CacheResult<()> {
        let pattern = PathPattern::new(pattern)?;
        self.send_and_wait(|respond| Command::Ignore { pattern, respond })?
    }

    /// Record that `path` was uploaded at `timestamp`.
    pub fn record_upload(&self, path: impl AsRef<Path>, timestamp: EpochMillis) -> CacheResult<()> {
        let path = path.as_ref().to_path_buf();
        self.send_and_wait(|respond| Command::RecordUpload {
            path,
            timestamp,
            respond,
        })?
    }

    pub fn file_status(&self, path: impl AsRef<Path>) -> CacheResult<FileStatus> {
        let path = path.as_ref().to_path_buf();
        self.send_and_wait(|respond| Command::QueryFileStatus { path, respond })
    }

    /// Copy of the actor's whole store.
    pub fn snapshot(&self) -> CacheResult<CacheStore> {
        self.send_and_wait(|respond| Command::QuerySnapshot { respond })
    }

    /// Stop the actor. Commands sent earlier are answered first.
    pub fn terminate(&self) -> CacheResult<()> {
        self.send_and_wait(|respond| Command::Terminate { respond })
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("cmd_tx", &"<Sender>")
            .finish()
    }
}

/// The actor: owns the store and the path it persists to.
struct CacheActor {
    store: CacheStore,
    cache_file: PathBuf,
    commands: Receiver<Command>,
}

impl CacheActor {
    /// Run the actor loop. Blocks until Terminate or every handle is gone.
    fn run(mut self) {
        info!("Cache actor serving {}", self.cache_file.display());

        loop {
            match self.commands.recv() {
                Ok(Command::Terminate { respond }) => {
                    info!("Cache actor received terminate");
                    let _ = respond.send(());
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(_) => {
                    info!("Cache command channel closed");
                    break;
                }
            }
        }

        info!("Cache actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Freeze {
                root,
                pattern,
                deadline,
                respond,
            } => {
                self.store.add_freeze(pattern.clone(), deadline);
                let recorded = self.store.record_frozen_timestamps(&root, &pattern);
                info!(
                    "Froze '{}' at {} ({} entries under {})",
                    pattern,
                    deadline,
                    recorded,
                    root.display()
                );
                let _ = respond.send(self.persist());
            }

            Command::Ignore { pattern, respond } => {
                info!("Ignoring '{}'", pattern);
                self.store.add_ignore(pattern);
                let _ = respond.send(self.persist());
            }

            Command::RecordUpload {
                path,
                timestamp,
                respond,
            } => {
                debug!("Recording upload of {} at {}", path.display(), timestamp);
                self.store.record_upload(&path, timestamp);
                let _ = respond.send(self.persist());
            }

            Command::QueryFileStatus { path, respond } => {
                let _ = respond.send(self.store.file_status(&path));
            }

            Command::QuerySnapshot { respond } => {
                let _ = respond.send(self.store.clone());
            }

            Command::Terminate { .. } => {
                // Handled in run loop
            }
        }
    }

    fn persist(&self) -> CacheResult<()> {
        let result = self.store.save(&self.cache_file);
        if let Err(ref err) = result {
            error!("{}", err);
        }
        result
    }
}

/// Spawn the cache actor in a dedicated thread.
///
/// Returns once the store has been loaded. A missing or empty document starts
/// an empty store; a malformed one is returned as an error.
pub fn spawn_cache(cache_file: impl Into<PathBuf>) -> CacheResult<(CacheHandle, JoinHandle<()>)> {
    let cache_file = cache_file.into();
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);

    let thread = thread::Builder::new()
        .name("uploader-cache".to_string())
        .spawn(move || {
            let store = match CacheStore::load(&cache_file) {
                Ok(store) => store,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let actor = CacheActor {
                store,
                cache_file,
                commands: cmd_rx,
            };
            actor.run();
        })
        .map_err(CacheError::Spawn)?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok((CacheHandle::new(cmd_tx), thread)),
        Ok(Err(err)) => {
            let _ = thread.join();
            Err(err)
        }
        Err(_) => {
            let _ = thread.join();
            Err(CacheError::ActorUnavailable)
        }
    }
}

/// Owns a running cache actor.
///
/// Dereferences to [`CacheHandle`]. Closing (or dropping) sends Terminate and
/// waits for the actor thread to finish.
pub struct UploaderCache {
    handle: CacheHandle,
    thread: Option<JoinHandle<()>>,
}

impl UploaderCache {
    /// Load `cache_file` and start serving it.
    pub fn open(cache_file: impl Into<PathBuf>) -> CacheResult<Self> {
        let (handle, thread) = spawn_cache(cache_file)?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// A cloneable handle for other threads.
    pub fn handle(&self) -> CacheHandle {
        self.handle.clone()
    }

    /// Terminate the actor and wait for it to stop.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            // Already stopped if another handle terminated it.
            let _ = self.handle.terminate();
            if thread.join().is_err() {
                error!("Cache actor thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for UploaderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploaderCache")
            .field("handle", &self.handle)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Deref for UploaderCache {
    type Target = CacheHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for UploaderCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}
