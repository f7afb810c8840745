//! Conversion job row operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use vf_core::{ConversionJob, ConversionJobId, Error, JobStatus, Result, VideoId};

use crate::models::{fmt_ts, FromRow, JOB_COLS};

/// Insert a fully-formed conversion job row.
pub fn insert_job(conn: &Connection, job: &ConversionJob) -> Result<()> {
    conn.execute(
        "INSERT INTO conversion_jobs (id, video_id, resolution, status, progress, output_path,
            output_url, file_size, error_message, started_at, completed_at, version,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            job.id.to_string(),
            job.video_id.to_string(),
            job.resolution.as_str(),
            job.status.as_str(),
            job.progress,
            job.output_path,
            job.output_url,
            job.file_size,
            job.error_message,
            job.started_at.map(fmt_ts),
            job.completed_at.map(fmt_ts),
            job.version as i64,
            fmt_ts(job.created_at),
            fmt_ts(job.updated_at),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Get a conversion job by ID.
pub fn get_job(conn: &Connection, id: ConversionJobId) -> Result<Option<ConversionJob>> {
    let q = format!("SELECT {JOB_COLS} FROM conversion_jobs WHERE id = ?1");
    match conn.query_row(&q, [id.to_string()], ConversionJob::from_row) {
        Ok(j) => Ok(Some(j)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// List a video's jobs in creation order (1080p first for a fresh upload).
pub fn list_jobs_for_video(conn: &Connection, video_id: VideoId) -> Result<Vec<ConversionJob>> {
    let q = format!(
        "SELECT {JOB_COLS} FROM conversion_jobs WHERE video_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([video_id.to_string()], ConversionJob::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Jobs in `status` whose last write happened before `before`.
pub fn list_jobs_idle_since(
    conn: &Connection,
    status: JobStatus,
    before: DateTime<Utc>,
) -> Result<Vec<ConversionJob>> {
    let q = format!(
        "SELECT {JOB_COLS} FROM conversion_jobs WHERE status = ?1 AND updated_at < ?2
         ORDER BY updated_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map(params![status.as_str(), fmt_ts(before)], ConversionJob::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Overwrite the mutable columns of an existing row.
///
/// Returns false if the row does not exist.
pub fn write_job(conn: &Connection, job: &ConversionJob) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE conversion_jobs SET status = ?1, progress = ?2, output_path = ?3,
                output_url = ?4, file_size = ?5, error_message = ?6, started_at = ?7,
                completed_at = ?8, version = ?9, updated_at = ?10
             WHERE id = ?11",
            params![
                job.status.as_str(),
                job.progress,
                job.output_path,
                job.output_url,
                job.file_size,
                job.error_message,
                job.started_at.map(fmt_ts),
                job.completed_at.map(fmt_ts),
                job.version as i64,
                fmt_ts(job.updated_at),
                job.id.to_string(),
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}
