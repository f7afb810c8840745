//! Realtime sync: a keyed projection of one user's videos kept current from
//! change notifications.
//!
//! Events are applied idempotently. Inserts add or replace, updates merge
//! into an existing entry, deletes remove. Every row carries a `version`, and
//! an event whose version is not newer than the projected row is ignored, so
//! duplicates and late deliveries never move the projection backwards.
//!
//! [`SyncObserver`] subscribes before it loads the initial snapshot, then
//! applies deliveries until cancelled, skipping any record at or below the
//! last sequence number it has accounted for. When the subscription reports
//! that records were dropped it replays them from the notifier's history, and
//! reloads the whole projection from the store only if the history has
//! already moved past them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vf_core::{
    ChangeEvent, ChangeRecord, ConversionJob, ConversionJobId, Delivery, JobStore, Resolution,
    Result, UserId, Video, VideoId, VideoWithJobs,
};

/// What applying one event did to the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    Applied,
    /// The projection already held this version or a newer one.
    Stale,
    /// The event does not concern anything in the projection.
    Ignored,
}

/// One user's videos and their jobs, keyed by id.
#[derive(Debug, Clone)]
pub struct VideoProjection {
    user_id: UserId,
    videos: HashMap<VideoId, Video>,
    jobs: HashMap<ConversionJobId, ConversionJob>,
}

impl VideoProjection {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            videos: HashMap::new(),
            jobs: HashMap::new(),
        }
    }

    /// Build a projection from the store's current state.
    pub fn load(store: &dyn JobStore, user_id: UserId) -> Result<Self> {
        let mut projection = Self::new(user_id);
        projection.resync(store)?;
        Ok(projection)
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Replace everything with a fresh snapshot from the store.
    pub fn resync(&mut self, store: &dyn JobStore) -> Result<()> {
        let snapshot = store.list_videos_with_jobs(self.user_id)?;
        self.videos.clear();
        self.jobs.clear();
        for entry in snapshot {
            for job in entry.conversion_jobs {
                self.jobs.insert(job.id, job);
            }
            self.videos.insert(entry.video.id, entry.video);
        }
        tracing::debug!(user_id = %self.user_id, videos = self.videos.len(), "projection resynced");
        Ok(())
    }

    /// Apply one change event.
    ///
    /// Only `VideoInserted` touches the store, re-fetching the new video
    /// together with its jobs.
    pub fn apply(&mut self, event: &ChangeEvent, store: &dyn JobStore) -> Result<ApplyOutcome> {
        let outcome = match event {
            ChangeEvent::VideoInserted { video } => {
                if video.user_id != self.user_id {
                    return Ok(ApplyOutcome::Ignored);
                }
                match store.get_video_with_jobs(video.id)? {
                    Some(fetched) => self.upsert(fetched),
                    None => ApplyOutcome::Ignored,
                }
            }
            ChangeEvent::VideoUpdated {
                id,
                fields,
                version,
                updated_at,
            } => match self.videos.get_mut(id) {
                None => ApplyOutcome::Ignored,
                Some(video) if *version <= video.version => ApplyOutcome::Stale,
                Some(video) => {
                    fields.apply_to(video);
                    video.version = *version;
                    video.updated_at = *updated_at;
                    ApplyOutcome::Applied
                }
            },
            ChangeEvent::VideoDeleted { id } => {
                if self.videos.remove(id).is_some() {
                    self.jobs.retain(|_, job| job.video_id != *id);
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Ignored
                }
            }
            ChangeEvent::JobInserted { job } => {
                if !self.videos.contains_key(&job.video_id) {
                    ApplyOutcome::Ignored
                } else {
                    self.upsert_job(job)
                }
            }
            ChangeEvent::JobUpdated { job } => {
                if self.jobs.contains_key(&job.id) {
                    self.upsert_job(job)
                } else {
                    ApplyOutcome::Ignored
                }
            }
            ChangeEvent::JobDeleted { id, .. } => {
                if self.jobs.remove(id).is_some() {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Ignored
                }
            }
        };
        tracing::trace!(kind = event.kind(), video_id = %event.video_id(), ?outcome, "change applied");
        Ok(outcome)
    }

    fn upsert(&mut self, fetched: VideoWithJobs) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::Stale;
        let video = fetched.video;
        let newer = self
            .videos
            .get(&video.id)
            .map_or(true, |current| video.version > current.version);
        if newer {
            self.videos.insert(video.id, video);
            outcome = ApplyOutcome::Applied;
        }
        for job in &fetched.conversion_jobs {
            if self.upsert_job(job) == ApplyOutcome::Applied {
                outcome = ApplyOutcome::Applied;
            }
        }
        outcome
    }

    fn upsert_job(&mut self, job: &ConversionJob) -> ApplyOutcome {
        match self.jobs.get(&job.id) {
            Some(current) if job.version <= current.version => ApplyOutcome::Stale,
            _ => {
                self.jobs.insert(job.id, job.clone());
                ApplyOutcome::Applied
            }
        }
    }

    pub fn video(&self, id: VideoId) -> Option<&Video> {
        self.videos.get(&id)
    }

    pub fn job(&self, id: ConversionJobId) -> Option<&ConversionJob> {
        self.jobs.get(&id)
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    /// A video with its jobs, in creation order.
    pub fn get(&self, id: VideoId) -> Option<VideoWithJobs> {
        let video = self.videos.get(&id)?.clone();
        let mut conversion_jobs: Vec<ConversionJob> = self
            .jobs
            .values()
            .filter(|job| job.video_id == id)
            .cloned()
            .collect();
        conversion_jobs.sort_by_key(|job| (job.created_at, resolution_rank(job.resolution)));
        Some(VideoWithJobs {
            video,
            conversion_jobs,
        })
    }

    /// All projected videos, newest first.
    pub fn snapshot(&self) -> Vec<VideoWithJobs> {
        let mut ids: Vec<(chrono::DateTime<chrono::Utc>, VideoId)> = self
            .videos
            .values()
            .map(|video| (video.created_at, video.id))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        ids.into_iter().filter_map(|(_, id)| self.get(id)).collect()
    }
}

fn resolution_rank(resolution: Resolution) -> usize {
    Resolution::ALL
        .iter()
        .position(|r| *r == resolution)
        .unwrap_or(Resolution::ALL.len())
}

/// Something the observer did, handed to its listener.
#[derive(Debug, Clone)]
pub enum SyncUpdate {
    Change {
        record: ChangeRecord,
        outcome: ApplyOutcome,
    },
    /// The subscription dropped `missed` records; `replayed` of them
    /// belonged to this user and were applied from the notifier's history.
    Replayed { missed: u64, replayed: usize },
    /// The projection was reloaded from the store. `missed` is 0 when the
    /// reload followed a failed apply rather than a lag.
    Resynced { missed: u64 },
}

/// Background task keeping a [`VideoProjection`] current.
pub struct SyncObserver {
    projection: Arc<RwLock<VideoProjection>>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl SyncObserver {
    /// Start observing `user_id`'s videos.
    pub fn spawn(store: Arc<dyn JobStore>, user_id: UserId) -> Result<Self> {
        Self::spawn_with_listener(store, user_id, |_| {})
    }

    /// Like [`spawn`](Self::spawn), calling `listener` after every applied
    /// delivery. The projection lock is not held during the call.
    pub fn spawn_with_listener<F>(
        store: Arc<dyn JobStore>,
        user_id: UserId,
        mut listener: F,
    ) -> Result<Self>
    where
        F: FnMut(&SyncUpdate) + Send + 'static,
    {
        let mut subscription = store.subscribe(user_id);
        let cancel = subscription.cancel_handle();
        // Everything up to here committed before the load below.
        let mut last_seq = store.notifier().last_seq();
        let projection = Arc::new(RwLock::new(VideoProjection::load(store.as_ref(), user_id)?));

        let shared = projection.clone();
        let handle = tokio::spawn(async move {
            tracing::debug!(user_id = %user_id, last_seq, "sync observer started");
            while let Some(delivery) = subscription.next().await {
                let update = match delivery {
                    Delivery::Change(record) if record.seq <= last_seq => {
                        tracing::trace!(seq = record.seq, "already accounted for");
                        continue;
                    }
                    Delivery::Change(record) => {
                        let outcome = shared.write().apply(&record.event, store.as_ref());
                        match outcome {
                            Ok(outcome) => {
                                last_seq = record.seq;
                                SyncUpdate::Change { record, outcome }
                            }
                            Err(e) => {
                                tracing::warn!(user_id = %user_id, seq = record.seq, error = %e, "apply failed; resyncing");
                                last_seq = reload(&shared, store.as_ref())?;
                                SyncUpdate::Resynced { missed: 0 }
                            }
                        }
                    }
                    Delivery::Lagged(missed) => {
                        match replay(&shared, store.as_ref(), user_id, &mut last_seq) {
                            Some(replayed) => {
                                tracing::debug!(user_id = %user_id, missed, replayed, "sync observer lagged; replayed from history");
                                SyncUpdate::Replayed { missed, replayed }
                            }
                            None => {
                                tracing::warn!(user_id = %user_id, missed, "sync observer lagged past history; resyncing");
                                last_seq = reload(&shared, store.as_ref())?;
                                SyncUpdate::Resynced { missed }
                            }
                        }
                    }
                };
                listener(&update);
            }
            tracing::debug!(user_id = %user_id, "sync observer stopped");
            Ok::<(), vf_core::Error>(())
        });

        Ok(Self {
            projection,
            cancel,
            handle,
        })
    }

    /// Shared handle to the live projection.
    pub fn projection(&self) -> Arc<RwLock<VideoProjection>> {
        self.projection.clone()
    }

    /// Copy of the current projection.
    pub fn snapshot(&self) -> Vec<VideoWithJobs> {
        self.projection.read().snapshot()
    }

    /// Stop delivery. Records already in flight are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(vf_core::Error::Internal(format!(
                "sync observer task failed: {e}"
            ))),
        }
    }
}

/// Reload from the store. Returns the sequence number the reload covers.
fn reload(shared: &RwLock<VideoProjection>, store: &dyn JobStore) -> Result<u64> {
    let seq = store.notifier().last_seq();
    shared.write().resync(store)?;
    Ok(seq)
}

/// Apply `user_id`'s records after `last_seq` from the notifier's history.
///
/// Returns how many were applied, or `None` when the history no longer
/// covers the gap or an apply failed, either of which needs a reload.
fn replay(
    shared: &RwLock<VideoProjection>,
    store: &dyn JobStore,
    user_id: UserId,
    last_seq: &mut u64,
) -> Option<usize> {
    let records = store.notifier().replay_since(user_id, *last_seq)?;
    let mut projection = shared.write();
    for record in &records {
        if let Err(e) = projection.apply(&record.event, store) {
            tracing::warn!(user_id = %user_id, seq = record.seq, error = %e, "replay apply failed");
            return None;
        }
        *last_seq = record.seq;
    }
    Some(records.len())
}
