//! Persistence for upload task snapshots.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{UploadRecord, UploadStatus};

impl Database {
    /// Insert or overwrite the snapshot of an upload task.
    pub fn save_upload(&self, record: &UploadRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO uploads (id, source_ref, destination_key, bytes_total, bytes_transferred, status, address, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                bytes_transferred = excluded.bytes_transferred,
                status = excluded.status,
                address = excluded.address,
                updated_at = excluded.updated_at",
            params![
                record.id.to_string(),
                record.source_ref,
                record.destination_key,
                record.bytes_total as i64,
                record.bytes_transferred as i64,
                record.status.as_str(),
                record.address,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_upload(&self, id: Uuid) -> Result<UploadRecord> {
        self.conn()
            .query_row(
                "SELECT id, source_ref, destination_key, bytes_total, bytes_transferred, status, address, updated_at
                 FROM uploads WHERE id = ?1",
                params![id.to_string()],
                row_to_upload,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List upload snapshots, optionally only those in `status`, newest first.
    pub fn list_uploads(&self, status: Option<UploadStatus>) -> Result<Vec<UploadRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, source_ref, destination_key, bytes_total, bytes_transferred, status, address, updated_at
             FROM uploads
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY updated_at DESC",
        )?;

        let rows = stmt.query_map(params![status.map(|s| s.as_str())], row_to_upload)?;

        let mut uploads = Vec::new();
        for row in rows {
            uploads.push(row?);
        }
        Ok(uploads)
    }
}

fn row_to_upload(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadRecord> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(5)?;
    let updated_str: String = row.get(7)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let status = UploadStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown upload status {status_str:?}").into(),
        )
    })?;

    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(UploadRecord {
        id,
        source_ref: row.get(1)?,
        destination_key: row.get(2)?,
        bytes_total: row.get::<_, i64>(3)? as u64,
        bytes_transferred: row.get::<_, i64>(4)? as u64,
        status,
        address: row.get(6)?,
        updated_at,
    })
}
