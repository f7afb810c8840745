//! Video and conversion job records, plus the partial-update patches the job
//! store applies to them.
//!
//! [`JobPatch::apply_to`] is the single place where the job state machine is
//! enforced. The store runs it inside its write transaction, so an illegal
//! transition is rejected before anything is persisted or broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversionJobId, UserId, VideoId};
use crate::media::{JobStatus, Resolution, VideoStatus};
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Video
// ---------------------------------------------------------------------------

/// An uploaded media asset and the aggregate root of its conversion jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: VideoId,
    pub user_id: UserId,
    pub title: String,
    pub original_filename: String,
    pub mime_type: String,
    pub storage_path: String,
    pub file_size: i64,
    pub duration_secs: Option<f64>,
    pub thumbnail_path: Option<String>,
    pub status: VideoStatus,
    /// Incremented on every persisted write to this row.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the upload collaborator when a video is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVideo {
    pub user_id: UserId,
    pub title: String,
    pub original_filename: String,
    pub mime_type: String,
    pub storage_path: String,
    pub file_size: i64,
}

/// A video together with its conversion jobs, as observers see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoWithJobs {
    #[serde(flatten)]
    pub video: Video,
    pub conversion_jobs: Vec<ConversionJob>,
}

impl VideoWithJobs {
    /// Find the job for a given resolution.
    pub fn job_for(&self, resolution: Resolution) -> Option<&ConversionJob> {
        self.conversion_jobs
            .iter()
            .find(|j| j.resolution == resolution)
    }

    /// Jobs that have not been started yet, in creation order.
    pub fn pending_jobs(&self) -> Vec<ConversionJob> {
        self.conversion_jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect()
    }
}

/// Partial update of a video row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VideoStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
}

impl VideoPatch {
    pub fn status(status: VideoStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Merge the set fields into `video`.
    pub fn apply_to(&self, video: &mut Video) {
        if let Some(status) = self.status {
            video.status = status;
        }
        if let Some(ref title) = self.title {
            video.title = title.clone();
        }
        if let Some(duration) = self.duration_secs {
            video.duration_secs = Some(duration);
        }
        if let Some(ref thumb) = self.thumbnail_path {
            video.thumbnail_path = Some(thumb.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// ConversionJob
// ---------------------------------------------------------------------------

/// One per-resolution transcode task belonging to a video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: ConversionJobId,
    pub video_id: VideoId,
    pub resolution: Resolution,
    pub status: JobStatus,
    /// Whole percent, 0..=100.
    pub progress: u8,
    pub output_path: Option<String>,
    pub output_url: Option<String>,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented on every persisted write to this row.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Highest progress a job may hold while still `processing`. 100 is only
/// ever written together with `completed`.
pub const MAX_IN_FLIGHT_PROGRESS: u8 = 99;

/// Partial update of a conversion job row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub output_path: Option<String>,
    pub output_url: Option<String>,
    pub file_size: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    /// `pending -> processing`: stamps `started_at` and resets progress.
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            progress: Some(0),
            started_at: Some(now),
            ..Self::default()
        }
    }

    /// Progress-only update for a job that is already processing.
    pub fn progress(pct: u8) -> Self {
        Self {
            progress: Some(pct),
            ..Self::default()
        }
    }

    /// `processing -> completed` with the stored output.
    pub fn complete(
        output_path: impl Into<String>,
        output_url: impl Into<String>,
        file_size: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            output_path: Some(output_path.into()),
            output_url: Some(output_url.into()),
            file_size: Some(file_size),
            completed_at: Some(now),
            ..Self::default()
        }
    }

    /// `processing -> failed` with the reason.
    pub fn fail(error_message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(error_message.into()),
            completed_at: Some(now),
            ..Self::default()
        }
    }

    /// Validate this patch against the job's current state and merge it.
    ///
    /// Rejected with [`Error::InvalidState`]:
    /// - leaving a terminal state, or re-entering `pending`
    /// - skipping `processing` on the way to a terminal state
    /// - moving progress backwards while processing, or past
    ///   [`MAX_IN_FLIGHT_PROGRESS`] before completion
    /// - setting progress outside `processing`, or anything but 100 on completion
    /// - output or error fields on a non-terminal job
    /// - overwriting an already-set `started_at` / `completed_at`
    ///
    /// `job` is only modified when the whole patch is valid.
    pub fn apply_to(&self, job: &mut ConversionJob) -> Result<()> {
        let current = job.status;
        let next = self.status.unwrap_or(current);

        if !current.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "conversion job {} cannot move from {current} to {next}",
                job.id
            )));
        }

        if let Some(pct) = self.progress {
            if pct > 100 {
                return Err(Error::Validation(format!("progress {pct} exceeds 100")));
            }
            match (current, next) {
                (JobStatus::Pending, JobStatus::Processing) => {}
                (JobStatus::Processing, JobStatus::Processing) if pct > MAX_IN_FLIGHT_PROGRESS => {
                    return Err(Error::invalid_state(format!(
                        "progress {pct} is reserved for completion of conversion job {}",
                        job.id
                    )));
                }
                (JobStatus::Processing, JobStatus::Processing) if pct >= job.progress => {}
                (JobStatus::Processing, JobStatus::Processing) => {
                    return Err(Error::invalid_state(format!(
                        "stale progress {pct} for conversion job {} (at {})",
                        job.id, job.progress
                    )));
                }
                (JobStatus::Processing, JobStatus::Completed) if pct == 100 => {}
                _ => {
                    return Err(Error::invalid_state(format!(
                        "progress cannot be set on a {next} conversion job"
                    )));
                }
            }
        }

        let has_outputs = self.output_path.is_some()
            || self.output_url.is_some()
            || self.file_size.is_some()
            || self.error_message.is_some();
        if has_outputs && !next.is_terminal() {
            return Err(Error::invalid_state(format!(
                "outputs can only be recorded on a terminal conversion job, not {next}"
            )));
        }

        if self.started_at.is_some() && job.started_at.is_some() {
            return Err(Error::invalid_state(format!(
                "conversion job {} already started",
                job.id
            )));
        }
        if self.completed_at.is_some() && job.completed_at.is_some() {
            return Err(Error::invalid_state(format!(
                "conversion job {} already finished",
                job.id
            )));
        }

        let now = Utc::now();
        job.status = next;
        match (current, next) {
            (JobStatus::Pending, JobStatus::Processing) => {
                job.started_at = Some(self.started_at.unwrap_or(now));
                job.progress = self.progress.unwrap_or(0);
            }
            (JobStatus::Processing, JobStatus::Processing) => {
                if let Some(pct) = self.progress {
                    job.progress = pct;
                }
            }
            (JobStatus::Processing, JobStatus::Completed) => {
                job.progress = 100;
                job.completed_at = Some(self.completed_at.unwrap_or(now));
            }
            (JobStatus::Processing, JobStatus::Failed) => {
                job.completed_at = Some(self.completed_at.unwrap_or(now));
            }
            _ => {}
        }

        if let Some(ref path) = self.output_path {
            job.output_path = Some(path.clone());
        }
        if let Some(ref url) = self.output_url {
            job.output_url = Some(url.clone());
        }
        if let Some(size) = self.file_size {
            job.file_size = Some(size);
        }
        if let Some(ref msg) = self.error_message {
            job.error_message = Some(msg.clone());
        }

        Ok(())
    }
}
