use crate::records::{ms_to_datetime, now_ms};
use crate::store_db::map_db_err;
use crate::ReplicaCatalog;
use catalog_lib::CatalogResult;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Running file and byte totals registered at one site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RseUsage {
    pub rse_id: String,
    pub files: i64,
    pub bytes: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

pub(crate) fn adjust_usage(conn: &Connection, rse_id: &str, files: i64, bytes: i64) -> CatalogResult<()> {
    if files == 0 && bytes == 0 {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO rse_usage (rse_id, files, bytes, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(rse_id) DO UPDATE SET
            files = files + excluded.files,
            bytes = bytes + excluded.bytes,
            updated_at = excluded.updated_at",
        params![rse_id, files, bytes, now_ms()],
    )
    .map_err(map_db_err)?;
    Ok(())
}

pub(crate) fn increase(conn: &Connection, rse_id: &str, files: u64, bytes: u64) -> CatalogResult<()> {
    adjust_usage(conn, rse_id, files as i64, bytes as i64)
}

pub(crate) fn decrease(conn: &Connection, rse_id: &str, files: u64, bytes: u64) -> CatalogResult<()> {
    adjust_usage(conn, rse_id, -(files as i64), -(bytes as i64))
}

impl ReplicaCatalog {
    pub fn get_rse_usage(&self, rse: &str) -> CatalogResult<RseUsage> {
        let rse_id = self.rse_id(rse)?;
        self.db.read(|conn| {
            let row = conn
                .query_row(
                    "SELECT files, bytes, updated_at FROM rse_usage WHERE rse_id = ?1",
                    params![rse_id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(map_db_err)?;
            Ok(match row {
                Some((files, bytes, updated_at)) => RseUsage {
                    rse_id: rse_id.clone(),
                    files,
                    bytes,
                    updated_at: Some(ms_to_datetime(updated_at)),
                },
                None => RseUsage {
                    rse_id: rse_id.clone(),
                    files: 0,
                    bytes: 0,
                    updated_at: None,
                },
            })
        })
    }
}
