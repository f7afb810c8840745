//! Conversion orchestrator.
//!
//! Drives one video's pending jobs to terminal states: marks the video
//! processing, fetches the source once, picks an encoder once, then runs
//! each job in order. A job that fails to encode or store its output is
//! marked failed and the run moves on. Anything else aborts the run after a
//! best-effort `failed` mark on the video.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use vf_av::{Encoder, ProgressReporter};
use vf_core::{
    ConversionJob, ConversionJobId, Error, JobPatch, JobStatus, JobStore, Resolution, Result,
    VideoId, VideoPatch, VideoStatus,
};

use crate::progress::ProgressWriter;
use crate::storage::MediaStorage;

/// Progress heartbeat used unless [`Orchestrator::with_heartbeat`] says
/// otherwise.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Storage path for one converted output.
///
/// The first `/`-separated segment of the source path (the owner's folder)
/// followed by `converted_<resolution>_<unix millis>.mp4`.
pub fn output_path(storage_path: &str, resolution: Resolution, unix_millis: i64) -> String {
    let prefix = storage_path.split('/').next().unwrap_or_default();
    format!("{prefix}/converted_{resolution}_{unix_millis}.mp4")
}

/// Outcome of one job within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: ConversionJobId,
    pub resolution: Resolution,
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error: Option<String>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub video_id: VideoId,
    /// Name of the encoder used for every job in the run.
    pub encoder: &'static str,
    /// Derived video status persisted at the end of the run.
    pub status: VideoStatus,
    pub jobs: Vec<JobOutcome>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed)
            .count()
    }
}

/// Runs conversions against a job store, a storage backend and an encoder.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    storage: Arc<dyn MediaStorage>,
    encoder: Option<Arc<dyn Encoder>>,
    fallback: Arc<dyn Encoder>,
    heartbeat: Option<Duration>,
}

impl Orchestrator {
    /// `encoder` is preferred when present and available; `fallback` is
    /// used for the whole run otherwise.
    pub fn new(
        store: Arc<dyn JobStore>,
        storage: Arc<dyn MediaStorage>,
        encoder: Option<Arc<dyn Encoder>>,
        fallback: Arc<dyn Encoder>,
    ) -> Self {
        Self {
            store,
            storage,
            encoder,
            fallback,
            heartbeat: Some(DEFAULT_HEARTBEAT),
        }
    }

    /// How often a job that reports no progress still gets a write.
    /// `None` disables the heartbeat.
    pub fn with_heartbeat(mut self, every: Option<Duration>) -> Self {
        self.heartbeat = every;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Convert `pending_jobs` of `video_id` from the source at `storage_path`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the video does not exist.
    /// - `InvalidState` if `pending_jobs` is empty, repeats a job, or holds a
    ///   job that is not a pending job of this video. Nothing is written.
    /// - `SourceUnavailable` if the source cannot be fetched. The video is
    ///   marked failed; jobs are left untouched.
    /// - `Database` if a state transition cannot be persisted. The video is
    ///   marked failed on a best-effort basis.
    pub async fn run_conversion(
        &self,
        video_id: VideoId,
        storage_path: &str,
        pending_jobs: &[ConversionJob],
    ) -> Result<RunReport> {
        let jobs = self.validate(video_id, pending_jobs)?;

        tracing::info!(video_id = %video_id, jobs = jobs.len(), "conversion run starting");

        if let Err(e) = self
            .store
            .update_video(video_id, VideoPatch::status(VideoStatus::Processing))
        {
            return Err(self.fail_run(video_id, e));
        }

        let source = match self.storage.fetch(storage_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = Error::source_unavailable(storage_path, e.to_string());
                return Err(self.fail_run(video_id, err));
            }
        };

        let encoder = self.select_encoder().await;
        tracing::info!(
            video_id = %video_id,
            encoder = encoder.name(),
            source_bytes = source.len(),
            "source fetched"
        );

        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in &jobs {
            match self.run_job(encoder.as_ref(), &source, job, storage_path).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => return Err(self.fail_run(video_id, e)),
            }
        }

        let status = match self.finalize(video_id) {
            Ok(status) => status,
            Err(e) => return Err(self.fail_run(video_id, e)),
        };

        let report = RunReport {
            video_id,
            encoder: encoder.name(),
            status,
            jobs: outcomes,
        };
        tracing::info!(
            video_id = %video_id,
            status = %status,
            completed = report.completed(),
            failed = report.failed(),
            "conversion run finished"
        );
        Ok(report)
    }

    /// Check the requested jobs against the store and return their current
    /// records in the requested order.
    fn validate(
        &self,
        video_id: VideoId,
        pending_jobs: &[ConversionJob],
    ) -> Result<Vec<ConversionJob>> {
        if self.store.get_video(video_id)?.is_none() {
            return Err(Error::not_found("video", video_id));
        }
        if pending_jobs.is_empty() {
            return Err(Error::invalid_state(format!(
                "no pending jobs given for video {video_id}"
            )));
        }

        let mut seen = HashSet::with_capacity(pending_jobs.len());
        let mut current = Vec::with_capacity(pending_jobs.len());
        for requested in pending_jobs {
            if !seen.insert(requested.id) {
                return Err(Error::invalid_state(format!(
                    "conversion job {} listed twice",
                    requested.id
                )));
            }
            let job = self.store.get_job(requested.id)?.ok_or_else(|| {
                Error::invalid_state(format!("conversion job {} does not exist", requested.id))
            })?;
            if requested.video_id != video_id || job.video_id != video_id {
                return Err(Error::invalid_state(format!(
                    "conversion job {} does not belong to video {video_id}",
                    job.id
                )));
            }
            if job.status != JobStatus::Pending {
                return Err(Error::invalid_state(format!(
                    "conversion job {} is {}, not pending",
                    job.id, job.status
                )));
            }
            current.push(job);
        }
        Ok(current)
    }

    async fn select_encoder(&self) -> Arc<dyn Encoder> {
        match &self.encoder {
            Some(encoder) if encoder.is_available().await => encoder.clone(),
            Some(encoder) => {
                tracing::warn!(
                    encoder = encoder.name(),
                    fallback = self.fallback.name(),
                    "encoder unavailable; using fallback for this run"
                );
                self.fallback.clone()
            }
            None => self.fallback.clone(),
        }
    }

    /// Drive one job to a terminal state.
    ///
    /// Encode and output-storage failures are recorded on the job. An `Err`
    /// means a state transition could not be persisted.
    async fn run_job(
        &self,
        encoder: &dyn Encoder,
        source: &Bytes,
        job: &ConversionJob,
        storage_path: &str,
    ) -> Result<JobOutcome> {
        let resolution = job.resolution;
        self.store.update_job(job.id, JobPatch::start(Utc::now()))?;
        tracing::info!(job_id = %job.id, resolution = %resolution, "conversion job started");

        let (reporter, rx) = ProgressReporter::channel();
        let writer =
            ProgressWriter::spawn_with_heartbeat(self.store.clone(), job.id, rx, self.heartbeat);
        let encoded = encoder
            .encode(source, resolution, &reporter)
            .await
            .map_err(|e| contain(e, |msg| Error::encode(resolution, msg)));
        drop(reporter);
        let stats = writer.finish().await;
        tracing::debug!(
            job_id = %job.id,
            written = stats.written,
            dropped = stats.dropped,
            "progress writer drained"
        );

        let stored = match encoded {
            Ok(data) => self.store_output(storage_path, resolution, data).await,
            Err(e) => Err(e),
        };

        match stored {
            Ok((path, url, size)) => {
                self.store
                    .update_job(job.id, JobPatch::complete(&path, &url, size, Utc::now()))?;
                tracing::info!(job_id = %job.id, resolution = %resolution, output_path = %path, "conversion job completed");
                Ok(JobOutcome {
                    job_id: job.id,
                    resolution,
                    status: JobStatus::Completed,
                    output_url: Some(url),
                    error: None,
                })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(job_id = %job.id, resolution = %resolution, error = %message, "conversion job failed");
                self.store
                    .update_job(job.id, JobPatch::fail(&message, Utc::now()))?;
                Ok(JobOutcome {
                    job_id: job.id,
                    resolution,
                    status: JobStatus::Failed,
                    output_url: None,
                    error: Some(message),
                })
            }
        }
    }

    async fn store_output(
        &self,
        storage_path: &str,
        resolution: Resolution,
        data: Bytes,
    ) -> Result<(String, String, i64)> {
        let path = output_path(storage_path, resolution, Utc::now().timestamp_millis());
        let size = i64::try_from(data.len()).unwrap_or(i64::MAX);
        let url = self
            .storage
            .store(&path, data)
            .await
            .map_err(|e| contain(e, Error::Storage))?;
        Ok((path, url, size))
    }

    /// Persist the status derived from a fresh job snapshot.
    fn finalize(&self, video_id: VideoId) -> Result<VideoStatus> {
        let jobs = self.store.list_jobs(video_id)?;
        let status = VideoStatus::derive(jobs.iter().map(|j| j.status));
        self.store
            .update_video(video_id, VideoPatch::status(status))?;
        Ok(status)
    }

    /// Best-effort `failed` mark on the video, returning `err` for the caller.
    fn fail_run(&self, video_id: VideoId, err: Error) -> Error {
        tracing::error!(video_id = %video_id, error = %err, "conversion run aborted");
        if let Err(e) = self
            .store
            .update_video(video_id, VideoPatch::status(VideoStatus::Failed))
        {
            tracing::warn!(video_id = %video_id, error = %e, "could not mark video failed");
        }
        err
    }
}

/// Keep a collaborator's job-level error as is; anything that would abort
/// the run is recorded against the job instead.
fn contain(err: Error, job_level: impl FnOnce(String) -> Error) -> Error {
    if err.is_run_level() {
        job_level(err.to_string())
    } else {
        err
    }
}
