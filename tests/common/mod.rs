//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires an in-memory SQLite store, a
//! temp-dir [`LocalStorage`], and a zero-delay fallback encoder into an
//! [`Orchestrator`]. The wrappers below inject failures into each
//! collaborator.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use vf_av::{Encoder, FallbackEncoder, ProgressReporter};
use vf_core::config::FallbackConfig;
use vf_core::{
    ChangeEvent, ChangeNotifier, ConversionJob, ConversionJobId, Delivery, Error, JobPatch,
    JobStore, NewVideo, Resolution, Result, Subscription, UserId, Video, VideoId, VideoPatch,
    VideoWithJobs,
};
use vf_db::{init_memory_pool, SqliteJobStore};
use vidforge::{LocalStorage, MediaStorage, Orchestrator};

pub const SOURCE: &[u8] = b"\x00\x00\x00\x18ftypmp42 pretend this is a movie";

/// In-memory store plus temp-dir storage.
pub struct TestHarness {
    pub dir: TempDir,
    pub store: Arc<SqliteJobStore>,
    pub storage: Arc<LocalStorage>,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = Arc::new(SqliteJobStore::new(
            init_memory_pool().expect("failed to create in-memory pool"),
            Arc::new(ChangeNotifier::new(1024)),
        ));
        let storage = Arc::new(LocalStorage::new(dir.path(), "http://media.test"));
        Self {
            dir,
            store,
            storage,
        }
    }

    fn new_video(&self, user_id: UserId, name: &str) -> NewVideo {
        let storage_path = format!("{user_id}/{name}");
        let file = self.dir.path().join(&storage_path);
        std::fs::create_dir_all(file.parent().expect("storage path has a parent"))
            .expect("failed to create user dir");
        std::fs::write(&file, SOURCE).expect("failed to write source");
        NewVideo {
            user_id,
            title: name.into(),
            original_filename: name.into(),
            mime_type: "video/mp4".into(),
            storage_path,
            file_size: SOURCE.len() as i64,
        }
    }

    /// Write a source file into storage and create its video with all four jobs.
    pub fn upload(&self, user_id: UserId, name: &str) -> VideoWithJobs {
        self.store
            .create_video(self.new_video(user_id, name))
            .expect("failed to create video")
    }

    /// Like [`upload`](Self::upload), with only the given resolutions.
    pub fn upload_with(
        &self,
        user_id: UserId,
        name: &str,
        resolutions: &[Resolution],
    ) -> VideoWithJobs {
        self.store
            .create_video_with_resolutions(self.new_video(user_id, name), resolutions)
            .expect("failed to create video")
    }

    /// Orchestrator with no real encoder and an instant fallback.
    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(None)
    }

    pub fn orchestrator_with(&self, encoder: Option<Arc<dyn Encoder>>) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.storage.clone(),
            encoder,
            instant_fallback(),
        )
    }

    pub fn video(&self, id: VideoId) -> VideoWithJobs {
        self.store
            .get_video_with_jobs(id)
            .expect("store read failed")
            .expect("video missing")
    }

    /// Bytes stored at an output path.
    pub fn read_output(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.dir.path().join(path)).expect("output missing")
    }
}

pub fn instant_fallback() -> Arc<dyn Encoder> {
    Arc::new(FallbackEncoder::new(FallbackConfig::instant()))
}

/// Drain every delivery currently buffered on `sub`.
pub async fn drain(sub: &mut Subscription) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await {
            Ok(Some(Delivery::Change(record))) => events.push(record.event),
            Ok(Some(Delivery::Lagged(n))) => panic!("subscription lagged by {n}"),
            Ok(None) | Err(_) => return events,
        }
    }
}

/// Progress values seen in `JobUpdated` events for one job, in order.
pub fn progress_trail(events: &[ChangeEvent], job_id: ConversionJobId) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            ChangeEvent::JobUpdated { job } if job.id == job_id => Some(job.progress),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// Reports 40% and then fails for the listed resolutions; otherwise
/// behaves like the instant fallback.
pub struct FailingEncoder {
    fail_on: HashSet<Resolution>,
    inner: FallbackEncoder,
}

impl FailingEncoder {
    pub fn new(fail_on: impl IntoIterator<Item = Resolution>) -> Self {
        Self {
            fail_on: fail_on.into_iter().collect(),
            inner: FallbackEncoder::new(FallbackConfig::instant()),
        }
    }
}

#[async_trait]
impl Encoder for FailingEncoder {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn encode(
        &self,
        source: &Bytes,
        target: Resolution,
        progress: &ProgressReporter,
    ) -> Result<Bytes> {
        if self.fail_on.contains(&target) {
            progress.report(0.4);
            tokio::task::yield_now().await;
            return Err(Error::encode(target, "simulated encoder crash"));
        }
        self.inner.encode(source, target, progress).await
    }
}

/// An encoder that is never available.
pub struct UnavailableEncoder;

#[async_trait]
impl Encoder for UnavailableEncoder {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn encode(&self, _: &Bytes, target: Resolution, _: &ProgressReporter) -> Result<Bytes> {
        Err(Error::encode(target, "should never be called"))
    }
}

/// Fails with a non-encode error, which the orchestrator must still treat
/// as a job-level failure.
pub struct BrokenEncoder;

#[async_trait]
impl Encoder for BrokenEncoder {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn encode(&self, _: &Bytes, _: Resolution, _: &ProgressReporter) -> Result<Bytes> {
        Err(Error::Internal("scratch disk vanished".into()))
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Wraps [`LocalStorage`], failing fetches or stores on demand.
pub struct FlakyStorage {
    inner: Arc<LocalStorage>,
    pub fail_fetch: AtomicBool,
    /// Fail stores whose path contains any of these fragments.
    pub fail_store_matching: Vec<String>,
}

impl FlakyStorage {
    pub fn new(inner: Arc<LocalStorage>) -> Self {
        Self {
            inner,
            fail_fetch: AtomicBool::new(false),
            fail_store_matching: Vec::new(),
        }
    }
}

#[async_trait]
impl MediaStorage for FlakyStorage {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("{path}: connection reset")));
        }
        self.inner.fetch(path).await
    }

    async fn store(&self, path: &str, data: Bytes) -> Result<String> {
        if self.fail_store_matching.iter().any(|f| path.contains(f.as_str())) {
            return Err(Error::Storage(format!("{path}: quota exceeded")));
        }
        self.inner.store(path, data).await
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Wraps [`SqliteJobStore`], failing selected kinds of job writes.
pub struct FlakyStore {
    inner: Arc<SqliteJobStore>,
    pub fail_progress: AtomicBool,
    pub fail_terminal: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteJobStore>) -> Self {
        Self {
            inner,
            fail_progress: AtomicBool::new(false),
            fail_terminal: AtomicBool::new(false),
        }
    }
}

impl JobStore for FlakyStore {
    fn create_video_with_resolutions(
        &self,
        new: NewVideo,
        resolutions: &[Resolution],
    ) -> Result<VideoWithJobs> {
        self.inner.create_video_with_resolutions(new, resolutions)
    }

    fn get_video(&self, id: VideoId) -> Result<Option<Video>> {
        self.inner.get_video(id)
    }

    fn get_video_with_jobs(&self, id: VideoId) -> Result<Option<VideoWithJobs>> {
        self.inner.get_video_with_jobs(id)
    }

    fn list_videos_with_jobs(&self, user_id: UserId) -> Result<Vec<VideoWithJobs>> {
        self.inner.list_videos_with_jobs(user_id)
    }

    fn list_jobs(&self, video_id: VideoId) -> Result<Vec<ConversionJob>> {
        self.inner.list_jobs(video_id)
    }

    fn get_job(&self, id: ConversionJobId) -> Result<Option<ConversionJob>> {
        self.inner.get_job(id)
    }

    fn update_video(&self, id: VideoId, patch: VideoPatch) -> Result<Video> {
        self.inner.update_video(id, patch)
    }

    fn update_job(&self, id: ConversionJobId, patch: JobPatch) -> Result<ConversionJob> {
        let terminal = patch.status.is_some_and(|s| s.is_terminal());
        let progress_only = patch.status.is_none() && patch.progress.is_some();
        if terminal && self.fail_terminal.load(Ordering::SeqCst) {
            return Err(Error::database("disk I/O error"));
        }
        if progress_only && self.fail_progress.load(Ordering::SeqCst) {
            return Err(Error::database("database is locked"));
        }
        self.inner.update_job(id, patch)
    }

    fn delete_video(&self, id: VideoId) -> Result<bool> {
        self.inner.delete_video(id)
    }

    fn list_stalled_jobs(&self, older_than: DateTime<Utc>) -> Result<Vec<ConversionJob>> {
        self.inner.list_stalled_jobs(older_than)
    }

    fn notifier(&self) -> &Arc<ChangeNotifier> {
        self.inner.notifier()
    }
}
