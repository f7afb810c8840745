//! The job store abstraction.
//!
//! The orchestrator, the realtime sync projection, and stall recovery only
//! talk to a [`JobStore`]. The SQLite implementation lives in `vf-db`; tests
//! wrap it to inject failures.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::events::{ChangeNotifier, Subscription};
use crate::ids::{ConversionJobId, UserId, VideoId};
use crate::media::Resolution;
use crate::models::{ConversionJob, JobPatch, NewVideo, Video, VideoPatch, VideoWithJobs};
use crate::Result;

/// Authoritative record of videos and their conversion jobs.
///
/// Every successful write publishes exactly one change event per affected
/// row, after the write is durable. Writes that fail publish nothing.
pub trait JobStore: Send + Sync {
    /// Create a video together with one pending job per resolution.
    fn create_video(&self, new: NewVideo) -> Result<VideoWithJobs> {
        self.create_video_with_resolutions(new, &Resolution::ALL)
    }

    /// Create a video with one pending job for each of `resolutions`, in
    /// that order. `Validation` if the list is empty or repeats a resolution.
    fn create_video_with_resolutions(
        &self,
        new: NewVideo,
        resolutions: &[Resolution],
    ) -> Result<VideoWithJobs>;

    fn get_video(&self, id: VideoId) -> Result<Option<Video>>;

    fn get_video_with_jobs(&self, id: VideoId) -> Result<Option<VideoWithJobs>>;

    /// All videos owned by `user_id`, newest first.
    fn list_videos_with_jobs(&self, user_id: UserId) -> Result<Vec<VideoWithJobs>>;

    /// Current snapshot of a video's jobs, in creation order.
    fn list_jobs(&self, video_id: VideoId) -> Result<Vec<ConversionJob>>;

    fn get_job(&self, id: ConversionJobId) -> Result<Option<ConversionJob>>;

    /// Apply a partial update. `NotFound` if the video does not exist.
    fn update_video(&self, id: VideoId, patch: VideoPatch) -> Result<Video>;

    /// Apply a partial update, enforcing the job state machine.
    ///
    /// `NotFound` if the job does not exist; `InvalidState` if the patch is
    /// illegal for the job's current state, in which case nothing is written.
    fn update_job(&self, id: ConversionJobId, patch: JobPatch) -> Result<ConversionJob>;

    /// Delete a video and its jobs. Returns whether the video existed.
    fn delete_video(&self, id: VideoId) -> Result<bool>;

    /// Jobs still `processing` whose last write is older than `older_than`.
    fn list_stalled_jobs(&self, older_than: DateTime<Utc>) -> Result<Vec<ConversionJob>>;

    /// The notifier this store publishes to.
    fn notifier(&self) -> &Arc<ChangeNotifier>;

    /// Convenience for `self.notifier().subscribe(user_id)`.
    fn subscribe(&self, user_id: UserId) -> Subscription {
        self.notifier().subscribe(user_id)
    }
}
