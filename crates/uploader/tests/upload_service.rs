//! End-to-end upload gating: service, worker and cache actor together, with
//! an in-process strategy standing in for the transport.

use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uploader::paths::modified_millis;
use uploader::{
    EpochMillis, StaticRouter, UploadError, UploadStrategy, UploaderCache, UploaderService,
    WorkerStats,
};
use url::Url;

fn set_mtime_millis(path: &Path, millis: EpochMillis) {
    let mtime = FileTime::from_unix_time(millis / 1000, ((millis % 1000) * 1_000_000) as u32);
    filetime::set_file_mtime(path, mtime).unwrap();
}

fn write_file(path: &Path, millis: EpochMillis) {
    fs::write(path, b"contents").unwrap();
    set_mtime_millis(path, millis);
}

fn destination() -> Url {
    Url::parse("memory://backup").unwrap()
}

/// Records the mtime of every upload and returns it as the upload timestamp.
#[derive(Default)]
struct RecordingStrategy {
    uploads: Mutex<Vec<(PathBuf, EpochMillis)>>,
    offline: AtomicBool,
}

impl RecordingStrategy {
    fn uploads(&self) -> Vec<(PathBuf, EpochMillis)> {
        self.uploads.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

impl UploadStrategy for RecordingStrategy {
    fn upload(&self, path: &Path, _destination: &Url) -> Result<EpochMillis, UploadError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(UploadError::Destination("offline".to_string()));
        }
        let modified = modified_millis(&fs::metadata(path)?)?;
        self.uploads.lock().unwrap().push((path.to_path_buf(), modified));
        Ok(modified)
    }
}

/// Blocks inside the first upload until released.
struct GatedStrategy {
    calls: Mutex<Vec<EpochMillis>>,
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl GatedStrategy {
    fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let strategy = Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        (strategy, started_rx, release_tx)
    }
}

impl UploadStrategy for GatedStrategy {
    fn upload(&self, path: &Path, _destination: &Url) -> Result<EpochMillis, UploadError> {
        let modified = modified_millis(&fs::metadata(path)?)?;
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(modified);
            calls.len() == 1
        };
        if first {
            let _ = self.started.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
        Ok(modified)
    }
}

/// Queue `files` on a fresh service, drain it, and return the worker stats.
fn run_pass<P: AsRef<Path>>(
    cache: &UploaderCache,
    strategy: &Arc<RecordingStrategy>,
    files: &[P],
) -> WorkerStats {
    let mut service = UploaderService::start(
        cache.handle(),
        StaticRouter::new(vec![destination()]),
        strategy.clone(),
    )
    .unwrap();
    for file in files {
        assert_eq!(service.queue_upload(file).unwrap(), 1);
    }
    service.terminate().unwrap();
    service.await_termination()
}

#[test]
fn test_new_file_uploaded_then_only_on_change() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    let file = temp.path().join("a.txt");
    write_file(&file, 1_000);

    let stats = run_pass(&cache, &strategy, &[&file]);
    assert_eq!(stats.uploaded, 1);
    assert_eq!(cache.file_status(&file).unwrap().last_uploaded, Some(1_000));

    let stats = run_pass(&cache, &strategy, &[&file]);
    assert_eq!((stats.uploaded, stats.skipped), (0, 1));

    set_mtime_millis(&file, 2_000);
    let stats = run_pass(&cache, &strategy, &[&file]);
    assert_eq!(stats.uploaded, 1);
    assert_eq!(strategy.uploads(), vec![(file.clone(), 1_000), (file.clone(), 2_000)]);
}

#[test]
fn test_ignored_file_never_uploaded() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    cache.ignore(r".*\.ignore.*").unwrap();

    let file = temp.path().join("notes.ignore.txt");
    write_file(&file, 1_000);
    run_pass(&cache, &strategy, &[&file]);

    set_mtime_millis(&file, 5_000);
    let stats = run_pass(&cache, &strategy, &[&file]);

    assert_eq!(stats.skipped, 1);
    assert_eq!(strategy.count(), 0);
    assert_eq!(cache.file_status(&file).unwrap().last_uploaded, None);
}

#[test]
fn test_frozen_before_creation_never_uploaded() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    cache.freeze(temp.path(), r".*\.freeze", 500).unwrap();

    let file = temp.path().join("late.freeze");
    for mtime in [1_000, 2_000, 3_000] {
        write_file(&file, mtime);
        run_pass(&cache, &strategy, &[&file]);
    }

    assert_eq!(strategy.count(), 0);
    let status = cache.file_status(&file).unwrap();
    assert_eq!(status.freeze_deadline, Some(500));
    assert_eq!(status.frozen_at, None);
}

#[test]
fn test_equal_mtime_is_up_to_date() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    let file = temp.path().join("d.txt");
    write_file(&file, 50_000);
    cache.record_upload(&file, 50_000).unwrap();

    assert_eq!(run_pass(&cache, &strategy, &[&file]).skipped, 1);

    set_mtime_millis(&file, 50_001);
    assert_eq!(run_pass(&cache, &strategy, &[&file]).uploaded, 1);
    assert_eq!(cache.file_status(&file).unwrap().last_uploaded, Some(50_001));
}

#[test]
fn test_freeze_catches_up_once_then_holds() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    let file = temp.path().join("backup.txt");

    write_file(&file, 1_000);
    run_pass(&cache, &strategy, &[&file]);

    // Edited after the last upload, then frozen: the frozen version goes out once.
    set_mtime_millis(&file, 2_000);
    cache.freeze(temp.path(), r".*\.txt", 2_500).unwrap();
    assert_eq!(cache.file_status(&file).unwrap().frozen_at, Some(2_000));
    let stats = run_pass(&cache, &strategy, &[&file]);
    assert_eq!(stats.uploaded, 1);

    // Later edits stay local.
    for mtime in [3_000, 4_000] {
        set_mtime_millis(&file, mtime);
        let stats = run_pass(&cache, &strategy, &[&file]);
        assert_eq!(stats.skipped, 1);
    }

    assert_eq!(strategy.uploads(), vec![(file.clone(), 1_000), (file.clone(), 2_000)]);
    assert_eq!(cache.file_status(&file).unwrap().last_uploaded, Some(2_000));
}

#[test]
fn test_burst_of_changes_collapses_to_two_uploads() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let (strategy, started, release) = GatedStrategy::new();
    let file = temp.path().join("busy.txt");
    write_file(&file, 1_000);

    let mut service = UploaderService::start(
        cache.handle(),
        StaticRouter::new(vec![destination()]),
        strategy.clone(),
    )
    .unwrap();

    service.queue_upload(&file).unwrap();
    started.recv().unwrap();
    for step in 2..=10 {
        set_mtime_millis(&file, step * 1_000);
        service.queue_upload(&file).unwrap();
    }
    service.terminate().unwrap();
    release.send(()).unwrap();

    let stats = service.await_termination();
    assert_eq!(*strategy.calls.lock().unwrap(), vec![1_000, 10_000]);
    assert_eq!((stats.processed, stats.uploaded, stats.skipped), (10, 2, 8));
    assert_eq!(cache.file_status(&file).unwrap().last_uploaded, Some(10_000));
}

#[test]
fn test_terminate_drains_earlier_requests_only() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());

    let files: Vec<PathBuf> = (0..3).map(|i| temp.path().join(format!("{}.txt", i))).collect();
    let late = temp.path().join("late.txt");
    for file in files.iter().chain(std::iter::once(&late)) {
        write_file(file, 1_000);
    }

    let mut service = UploaderService::start(
        cache.handle(),
        StaticRouter::new(vec![destination()]),
        strategy.clone(),
    )
    .unwrap();
    for file in &files {
        service.queue_upload(file).unwrap();
    }
    service.terminate().unwrap();
    // May or may not be accepted depending on timing; it is never processed.
    let _ = service.queue_upload(&late);

    let stats = service.await_termination();
    assert_eq!(stats.uploaded, 3);
    let uploaded: Vec<PathBuf> = strategy.uploads().into_iter().map(|(path, _)| path).collect();
    assert_eq!(uploaded, files);
    assert_eq!(cache.file_status(&late).unwrap().last_uploaded, None);
}

#[test]
fn test_abandon_drops_queue_after_in_flight_upload() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let (strategy, started, release) = GatedStrategy::new();

    let files: Vec<PathBuf> = (0..6).map(|i| temp.path().join(format!("{}.txt", i))).collect();
    for file in &files {
        write_file(file, 1_000);
    }

    let mut service = UploaderService::start(
        cache.handle(),
        StaticRouter::new(vec![destination()]),
        strategy.clone(),
    )
    .unwrap();
    service.queue_upload(&files[0]).unwrap();
    started.recv().unwrap();
    for file in &files[1..] {
        service.queue_upload(file).unwrap();
    }

    service.handle().abandon();
    release.send(()).unwrap();
    let stats = service.await_termination();

    assert_eq!(strategy.calls.lock().unwrap().len(), 1);
    assert_eq!((stats.uploaded, stats.abandoned), (1, 5));
    assert_eq!(cache.file_status(&files[0]).unwrap().last_uploaded, Some(1_000));
    assert_eq!(cache.file_status(&files[1]).unwrap().last_uploaded, None);
}

#[test]
fn test_empty_route_is_a_no_op() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    let file = temp.path().join("a.txt");
    write_file(&file, 1_000);

    let mut service =
        UploaderService::start(cache.handle(), |_: &Path| -> Vec<Url> { Vec::new() }, strategy.clone())
            .unwrap();
    assert_eq!(service.queue_upload(&file).unwrap(), 0);
    service.terminate().unwrap();

    assert_eq!(service.await_termination().processed, 0);
    assert_eq!(strategy.count(), 0);
}

#[test]
fn test_failed_upload_leaves_cache_for_retry() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    let file = temp.path().join("a.txt");
    write_file(&file, 1_000);

    strategy.offline.store(true, Ordering::SeqCst);
    let stats = run_pass(&cache, &strategy, &[&file]);
    assert_eq!(stats.failed, 1);
    assert_eq!(cache.file_status(&file).unwrap().last_uploaded, None);

    strategy.offline.store(false, Ordering::SeqCst);
    let stats = run_pass(&cache, &strategy, &[&file]);
    assert_eq!(stats.uploaded, 1);
    assert_eq!(cache.file_status(&file).unwrap().last_uploaded, Some(1_000));
}

#[test]
fn test_vanished_file_is_skipped() {
    let temp = TempDir::new().unwrap();
    let cache = UploaderCache::open(temp.path().join("cache.json")).unwrap();
    let strategy = Arc::new(RecordingStrategy::default());
    let file = temp.path().join("gone.txt");

    let stats = run_pass(&cache, &strategy, &[&file]);
    assert_eq!((stats.skipped, stats.failed), (1, 0));
    assert_eq!(strategy.count(), 0);
}
