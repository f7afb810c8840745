//! Video row operations.

use rusqlite::{params, Connection};
use vf_core::{Error, Result, UserId, Video, VideoId};

use crate::models::{fmt_ts, FromRow, VIDEO_COLS};

/// Insert a fully-formed video row.
pub fn insert_video(conn: &Connection, video: &Video) -> Result<()> {
    conn.execute(
        "INSERT INTO videos (id, user_id, title, original_filename, mime_type, storage_path,
            file_size, duration_secs, thumbnail_path, status, version, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            video.id.to_string(),
            video.user_id.to_string(),
            video.title,
            video.original_filename,
            video.mime_type,
            video.storage_path,
            video.file_size,
            video.duration_secs,
            video.thumbnail_path,
            video.status.as_str(),
            video.version as i64,
            fmt_ts(video.created_at),
            fmt_ts(video.updated_at),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Get a video by ID.
pub fn get_video(conn: &Connection, id: VideoId) -> Result<Option<Video>> {
    let q = format!("SELECT {VIDEO_COLS} FROM videos WHERE id = ?1");
    match conn.query_row(&q, [id.to_string()], Video::from_row) {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Owner of a video, without loading the whole row.
pub fn get_owner(conn: &Connection, id: VideoId) -> Result<Option<UserId>> {
    let result = conn.query_row(
        "SELECT user_id FROM videos WHERE id = ?1",
        [id.to_string()],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(s) => s
            .parse()
            .map(Some)
            .map_err(|e: uuid::Error| Error::database(e.to_string())),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// List a user's videos, newest first.
pub fn list_videos_for_user(conn: &Connection, user_id: UserId) -> Result<Vec<Video>> {
    let q = format!(
        "SELECT {VIDEO_COLS} FROM videos WHERE user_id = ?1
         ORDER BY created_at DESC, id DESC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([user_id.to_string()], Video::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Overwrite the mutable columns of an existing row.
///
/// Returns false if the row does not exist.
pub fn write_video(conn: &Connection, video: &Video) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE videos SET title = ?1, duration_secs = ?2, thumbnail_path = ?3,
                status = ?4, version = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                video.title,
                video.duration_secs,
                video.thumbnail_path,
                video.status.as_str(),
                video.version as i64,
                fmt_ts(video.updated_at),
                video.id.to_string(),
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Delete a video. Its jobs go with it via `ON DELETE CASCADE`.
/// Returns true if a row was deleted.
pub fn delete_video(conn: &Connection, id: VideoId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM videos WHERE id = ?1", [id.to_string()])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}
