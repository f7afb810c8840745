//! Stall recovery.
//!
//! A host that dies mid-run leaves jobs in `processing` forever. Progress
//! writes bump `updated_at`, so a processing job that has not been written
//! for longer than the stall timeout is treated as abandoned: it is marked
//! failed and its video's derived status is recomputed.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use vf_core::{
    ConversionJobId, Error, JobPatch, JobStore, Result, VideoId, VideoPatch, VideoStatus,
};

/// Jobs and videos touched by one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub failed_jobs: Vec<ConversionJobId>,
    /// Each affected video with its recomputed status.
    pub videos: Vec<(VideoId, VideoStatus)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.failed_jobs.is_empty()
    }
}

/// Error message recorded on a job failed by recovery.
pub fn stall_message(timeout: Duration) -> String {
    format!("conversion stalled: no progress for {}s", timeout.as_secs())
}

/// Fail every `processing` job idle for longer than `timeout`.
///
/// "Idle" means no write to the row at all. Orchestrator runs rewrite
/// progress on a heartbeat (see [`Orchestrator::with_heartbeat`]), so a live
/// job only looks idle if `timeout` is shorter than that heartbeat or the
/// heartbeat was disabled. If a live job is failed anyway, its run's
/// completion write is rejected with `InvalidState` and the run aborts.
///
/// A job that moves on between the scan and the write is skipped.
///
/// [`Orchestrator::with_heartbeat`]: crate::orchestrator::Orchestrator::with_heartbeat
pub fn recover_stalled(store: &dyn JobStore, timeout: Duration) -> Result<RecoveryReport> {
    let window = chrono::Duration::from_std(timeout)
        .map_err(|e| Error::Validation(format!("stall timeout out of range: {e}")))?;
    let cutoff = Utc::now() - window;
    let stalled = store.list_stalled_jobs(cutoff)?;
    if stalled.is_empty() {
        tracing::debug!(cutoff = %cutoff, "no stalled conversion jobs");
        return Ok(RecoveryReport::default());
    }

    let message = stall_message(timeout);
    let mut report = RecoveryReport::default();
    let mut touched: Vec<VideoId> = Vec::new();

    for job in stalled {
        match store.update_job(job.id, JobPatch::fail(&message, Utc::now())) {
            Ok(_) => {
                tracing::warn!(
                    job_id = %job.id,
                    video_id = %job.video_id,
                    resolution = %job.resolution,
                    last_write = %job.updated_at,
                    "stalled conversion job marked failed"
                );
                report.failed_jobs.push(job.id);
                if !touched.contains(&job.video_id) {
                    touched.push(job.video_id);
                }
            }
            Err(Error::InvalidState(reason)) => {
                tracing::debug!(job_id = %job.id, %reason, "job moved on; not recovering");
            }
            Err(e) => return Err(e),
        }
    }

    for video_id in touched {
        let jobs = store.list_jobs(video_id)?;
        let status = VideoStatus::derive(jobs.iter().map(|j| j.status));
        store.update_video(video_id, VideoPatch::status(status))?;
        report.videos.push((video_id, status));
    }

    tracing::info!(
        jobs = report.failed_jobs.len(),
        videos = report.videos.len(),
        "stall recovery finished"
    );
    Ok(report)
}
