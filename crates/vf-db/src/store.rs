//! SQLite implementation of [`JobStore`].
//!
//! Every write is a read-modify-write inside an IMMEDIATE transaction that
//! bumps the row `version` and `updated_at`. The change event is published
//! after commit while the store's write lock is still held, so per-entity
//! events reach subscribers in commit order.

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::TransactionBehavior;
use std::sync::Arc;
use vf_core::{
    ChangeEvent, ChangeNotifier, ConversionJob, ConversionJobId, Error, JobPatch, JobStatus,
    JobStore, NewVideo, Resolution, Result, UserId, Video, VideoId, VideoPatch, VideoStatus,
    VideoWithJobs,
};

use crate::pool::{get_conn, DbPool};
use crate::queries::{conversion_jobs, videos};

pub struct SqliteJobStore {
    pool: DbPool,
    notifier: Arc<ChangeNotifier>,
    write_lock: Mutex<()>,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            pool,
            notifier,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Run `f` inside an IMMEDIATE transaction and commit on success.
    fn write_tx<T>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::database(e.to_string()))?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        Ok(out)
    }
}

/// Current time at the precision the columns store.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Drop sub-microsecond precision from caller-supplied timestamps so the
/// published row matches what a later read returns.
fn normalize_job(job: &mut ConversionJob) {
    job.started_at = job.started_at.map(|t| t.trunc_subsecs(6));
    job.completed_at = job.completed_at.map(|t| t.trunc_subsecs(6));
}

fn with_jobs(conn: &rusqlite::Connection, video: Video) -> Result<VideoWithJobs> {
    let conversion_jobs = conversion_jobs::list_jobs_for_video(conn, video.id)?;
    Ok(VideoWithJobs {
        video,
        conversion_jobs,
    })
}

impl JobStore for SqliteJobStore {
    fn create_video_with_resolutions(
        &self,
        new: NewVideo,
        resolutions: &[Resolution],
    ) -> Result<VideoWithJobs> {
        if resolutions.is_empty() {
            return Err(Error::Validation("a video needs at least one resolution".into()));
        }
        for (i, resolution) in resolutions.iter().enumerate() {
            if resolutions[..i].contains(resolution) {
                return Err(Error::Validation(format!("resolution {resolution} listed twice")));
            }
        }

        let now = now();
        let video = Video {
            id: VideoId::new(),
            user_id: new.user_id,
            title: new.title,
            original_filename: new.original_filename,
            mime_type: new.mime_type,
            storage_path: new.storage_path,
            file_size: new.file_size,
            duration_secs: None,
            thumbnail_path: None,
            status: VideoStatus::Uploaded,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let jobs: Vec<ConversionJob> = resolutions
            .iter()
            .map(|&resolution| ConversionJob {
                id: ConversionJobId::new(),
                video_id: video.id,
                resolution,
                status: JobStatus::Pending,
                progress: 0,
                output_path: None,
                output_url: None,
                file_size: None,
                error_message: None,
                started_at: None,
                completed_at: None,
                version: 1,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let _guard = self.write_lock.lock();
        self.write_tx(|tx| {
            videos::insert_video(tx, &video)?;
            for job in &jobs {
                conversion_jobs::insert_job(tx, job)?;
            }
            Ok(())
        })?;

        tracing::info!(video_id = %video.id, user_id = %video.user_id, "video created with {} jobs", jobs.len());

        self.notifier.publish(
            video.user_id,
            ChangeEvent::VideoInserted {
                video: video.clone(),
            },
        );
        for job in &jobs {
            self.notifier
                .publish(video.user_id, ChangeEvent::JobInserted { job: job.clone() });
        }

        Ok(VideoWithJobs {
            video,
            conversion_jobs: jobs,
        })
    }

    fn get_video(&self, id: VideoId) -> Result<Option<Video>> {
        let conn = get_conn(&self.pool)?;
        videos::get_video(&conn, id)
    }

    fn get_video_with_jobs(&self, id: VideoId) -> Result<Option<VideoWithJobs>> {
        let conn = get_conn(&self.pool)?;
        match videos::get_video(&conn, id)? {
            Some(video) => Ok(Some(with_jobs(&conn, video)?)),
            None => Ok(None),
        }
    }

    fn list_videos_with_jobs(&self, user_id: UserId) -> Result<Vec<VideoWithJobs>> {
        let conn = get_conn(&self.pool)?;
        videos::list_videos_for_user(&conn, user_id)?
            .into_iter()
            .map(|video| with_jobs(&conn, video))
            .collect()
    }

    fn list_jobs(&self, video_id: VideoId) -> Result<Vec<ConversionJob>> {
        let conn = get_conn(&self.pool)?;
        conversion_jobs::list_jobs_for_video(&conn, video_id)
    }

    fn get_job(&self, id: ConversionJobId) -> Result<Option<ConversionJob>> {
        let conn = get_conn(&self.pool)?;
        conversion_jobs::get_job(&conn, id)
    }

    fn update_video(&self, id: VideoId, patch: VideoPatch) -> Result<Video> {
        let _guard = self.write_lock.lock();
        let video = self.write_tx(|tx| {
            let mut video =
                videos::get_video(tx, id)?.ok_or_else(|| Error::not_found("video", id))?;
            patch.apply_to(&mut video);
            video.version += 1;
            video.updated_at = now();
            videos::write_video(tx, &video)?;
            Ok(video)
        })?;

        tracing::debug!(video_id = %id, version = video.version, status = %video.status, "video updated");

        self.notifier.publish(
            video.user_id,
            ChangeEvent::VideoUpdated {
                id,
                fields: patch,
                version: video.version,
                updated_at: video.updated_at,
            },
        );
        Ok(video)
    }

    fn update_job(&self, id: ConversionJobId, patch: JobPatch) -> Result<ConversionJob> {
        let _guard = self.write_lock.lock();
        let (job, owner) = self.write_tx(|tx| {
            let mut job = conversion_jobs::get_job(tx, id)?
                .ok_or_else(|| Error::not_found("conversion_job", id))?;
            patch.apply_to(&mut job)?;
            normalize_job(&mut job);
            job.version += 1;
            job.updated_at = now();
            conversion_jobs::write_job(tx, &job)?;
            let owner = videos::get_owner(tx, job.video_id)?
                .ok_or_else(|| Error::not_found("video", job.video_id))?;
            Ok((job, owner))
        })?;

        tracing::debug!(
            job_id = %id,
            video_id = %job.video_id,
            resolution = %job.resolution,
            status = %job.status,
            progress = job.progress,
            version = job.version,
            "conversion job updated"
        );

        self.notifier
            .publish(owner, ChangeEvent::JobUpdated { job: job.clone() });
        Ok(job)
    }

    fn delete_video(&self, id: VideoId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let removed = self.write_tx(|tx| {
            let Some(video) = videos::get_video(tx, id)? else {
                return Ok(None);
            };
            let jobs = conversion_jobs::list_jobs_for_video(tx, id)?;
            videos::delete_video(tx, id)?;
            Ok(Some((video, jobs)))
        })?;

        let Some((video, jobs)) = removed else {
            return Ok(false);
        };

        tracing::info!(video_id = %id, "video deleted");

        for job in jobs {
            self.notifier.publish(
                video.user_id,
                ChangeEvent::JobDeleted {
                    id: job.id,
                    video_id: id,
                },
            );
        }
        self.notifier
            .publish(video.user_id, ChangeEvent::VideoDeleted { id });
        Ok(true)
    }

    fn list_stalled_jobs(&self, older_than: DateTime<Utc>) -> Result<Vec<ConversionJob>> {
        let conn = get_conn(&self.pool)?;
        conversion_jobs::list_jobs_idle_since(&conn, JobStatus::Processing, older_than)
    }

    fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }
}
