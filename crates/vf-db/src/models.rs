//! Row mapping between SQLite and the vf-core models.
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision and a
//! `Z` suffix, so lexical order matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use std::str::FromStr;
use uuid::Uuid;
use vf_core::{ConversionJob, Video};

/// Columns selected for a [`Video`], in `from_row` order.
pub const VIDEO_COLS: &str = "id, user_id, title, original_filename, mime_type, storage_path,
    file_size, duration_secs, thumbnail_path, status, version, created_at, updated_at";

/// Columns selected for a [`ConversionJob`], in `from_row` order.
pub const JOB_COLS: &str = "id, video_id, resolution, status, progress, output_path,
    output_url, file_size, error_message, started_at, completed_at, version,
    created_at, updated_at";

/// Build a value from a row selected with the matching column list.
pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self>;
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Format a timestamp the way every column stores it.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

/// Parse a text column through the type's `FromStr`.
fn parse_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = vf_core::Error>,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(v) => DateTime::parse_from_rfc3339(&v)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, e)),
        None => Ok(None),
    }
}

fn parse_version(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    Ok(v.max(0) as u64)
}

// ---------------------------------------------------------------------------
// Video
// ---------------------------------------------------------------------------

impl FromRow for Video {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            user_id: parse_id(row, 1)?,
            title: row.get(2)?,
            original_filename: row.get(3)?,
            mime_type: row.get(4)?,
            storage_path: row.get(5)?,
            file_size: row.get(6)?,
            duration_secs: row.get(7)?,
            thumbnail_path: row.get(8)?,
            status: parse_enum(row, 9)?,
            version: parse_version(row, 10)?,
            created_at: parse_ts(row, 11)?,
            updated_at: parse_ts(row, 12)?,
        })
    }
}

// ---------------------------------------------------------------------------
// ConversionJob
// ---------------------------------------------------------------------------

impl FromRow for ConversionJob {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let progress: i64 = row.get(4)?;
        Ok(Self {
            id: parse_id(row, 0)?,
            video_id: parse_id(row, 1)?,
            resolution: parse_enum(row, 2)?,
            status: parse_enum(row, 3)?,
            progress: progress.clamp(0, 100) as u8,
            output_path: row.get(5)?,
            output_url: row.get(6)?,
            file_size: row.get(7)?,
            error_message: row.get(8)?,
            started_at: parse_opt_ts(row, 9)?,
            completed_at: parse_opt_ts(row, 10)?,
            version: parse_version(row, 11)?,
            created_at: parse_ts(row, 12)?,
            updated_at: parse_ts(row, 13)?,
        })
    }
}
