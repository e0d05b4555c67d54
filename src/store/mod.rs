//! File metadata store: thin SQLite layer over the `files` table. Uploaded
//! bytes live on disk under the upload directory; this store tracks names,
//! sizes, password verifiers, and download counters.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

/// One row of the `files` table.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub original_name: String,
    pub stored_name: String,
    pub password_hash: String,
    pub file_size: i64,
    pub mime_type: String,
    pub download_count: i64,
    pub download_limit: Option<i64>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn limit_reached(&self) -> bool {
        self.download_limit
            .is_some_and(|limit| self.download_count >= limit)
    }
}

/// Fields supplied by the upload handler; the store assigns id, counter, and
/// creation time.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub original_name: String,
    pub stored_name: String,
    pub password_hash: String,
    pub file_size: i64,
    pub mime_type: String,
    pub download_limit: Option<i64>,
}

/// Partial update from the admin PATCH endpoint. `download_limit` is doubly
/// optional: outer None leaves the column alone, inner None clears it.
#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub is_enabled: Option<bool>,
    pub download_limit: Option<Option<i64>>,
    pub password_hash: Option<String>,
}

impl FileUpdate {
    pub fn is_empty(&self) -> bool {
        self.is_enabled.is_none() && self.download_limit.is_none() && self.password_hash.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    pub total_files: i64,
    pub total_downloads: i64,
    pub total_size: i64,
    pub active_files: i64,
    pub disabled_files: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTypeStat {
    #[serde(rename = "type")]
    pub label: String,
    pub count: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopFileStat {
    pub id: String,
    pub file_name: String,
    pub downloads: i64,
    pub size: i64,
}

/// Manages file metadata in SQLite.
///
/// Thread-safe: the inner SQLite connection is protected by a `Mutex`.
#[derive(Debug)]
pub struct FileStore {
    conn: Mutex<Connection>,
}

impl FileStore {
    /// Open (or create) the database at `db_path` and initialize the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("failed to create database directory: {}", dir.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;
        init_schema(&conn)?;

        tracing::info!(db_path = %db_path.display(), "file store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, new: NewFile) -> Result<FileRecord> {
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            original_name: new.original_name,
            stored_name: new.stored_name,
            password_hash: new.password_hash,
            file_size: new.file_size,
            mime_type: new.mime_type,
            download_count: 0,
            download_limit: new.download_limit,
            is_enabled: true,
            created_at: Utc::now(),
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO files (id, original_name, stored_name, password_hash, file_size,
                                mime_type, download_count, download_limit, is_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.original_name,
                record.stored_name,
                record.password_hash,
                record.file_size,
                record.mime_type,
                record.download_count,
                record.download_limit,
                record.is_enabled,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("inserting file record")?;

        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, original_name, stored_name, password_hash, file_size,
                    mime_type, download_count, download_limit, is_enabled, created_at
             FROM files WHERE id = ?1",
            params![id],
            row_to_record,
        )
        .optional()
        .context("querying file record")
    }

    /// Bump the download counter by one. The counter never decreases.
    pub fn increment_download_count(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE files SET download_count = download_count + 1 WHERE id = ?1",
                params![id],
            )
            .context("incrementing download count")?;
        anyhow::ensure!(changed == 1, "no file record with id {id}");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, original_name, stored_name, password_hash, file_size,
                    mime_type, download_count, download_limit, is_enabled, created_at
             FROM files ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_record)
            .context("listing file records")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Apply a partial update; returns the updated record, or None when the
    /// id does not exist. Rejects empty updates.
    pub fn update(&self, id: &str, update: &FileUpdate) -> Result<Option<FileRecord>> {
        anyhow::ensure!(!update.is_empty(), "no fields to update");

        {
            let conn = self.conn.lock().unwrap();
            let mut sets: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(enabled) = update.is_enabled {
                sets.push("is_enabled = ?");
                values.push(Box::new(enabled));
            }
            if let Some(limit) = update.download_limit {
                sets.push("download_limit = ?");
                values.push(Box::new(limit));
            }
            if let Some(hash) = &update.password_hash {
                sets.push("password_hash = ?");
                values.push(Box::new(hash.clone()));
            }
            values.push(Box::new(id.to_string()));

            let sql = format!(
                "UPDATE files SET {} WHERE id = ?",
                sets.join(", ")
            );
            let changed = conn
                .execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))
                .context("updating file record")?;
            if changed == 0 {
                return Ok(None);
            }
        }

        self.get(id)
    }

    /// Delete the record, returning its stored blob name so the caller can
    /// unlink the bytes.
    pub fn delete(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let stored_name: Option<String> = conn
            .query_row(
                "SELECT stored_name FROM files WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("querying file record for delete")?;

        if stored_name.is_some() {
            conn.execute("DELETE FROM files WHERE id = ?1", params![id])
                .context("deleting file record")?;
        }

        Ok(stored_name)
    }

    pub fn overview(&self) -> Result<OverviewStats> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(download_count), 0),
                    COALESCE(SUM(file_size), 0),
                    COUNT(CASE WHEN is_enabled = 1 THEN 1 END),
                    COUNT(CASE WHEN is_enabled = 0 THEN 1 END)
             FROM files",
            [],
            |row| {
                Ok(OverviewStats {
                    total_files: row.get(0)?,
                    total_downloads: row.get(1)?,
                    total_size: row.get(2)?,
                    active_files: row.get(3)?,
                    disabled_files: row.get(4)?,
                })
            },
        )
        .context("querying overview stats")
    }

    pub fn file_types(&self) -> Result<Vec<FileTypeStat>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT CASE
                        WHEN mime_type LIKE 'image/%' THEN 'Images'
                        WHEN mime_type LIKE 'video/%' THEN 'Videos'
                        WHEN mime_type LIKE 'audio/%' THEN 'Audio'
                        WHEN mime_type = 'application/pdf' THEN 'PDF'
                        WHEN mime_type = 'application/zip'
                             OR mime_type LIKE 'application/x-rar%'
                             OR mime_type LIKE 'application/x-7z%' THEN 'Archives'
                        WHEN mime_type LIKE 'text/%'
                             OR mime_type = 'application/json' THEN 'Text'
                        ELSE 'Other'
                    END AS type,
                    COUNT(*),
                    COALESCE(SUM(file_size), 0)
             FROM files GROUP BY type ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FileTypeStat {
                label: row.get(0)?,
                count: row.get(1)?,
                size: row.get(2)?,
            })
        })?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }

    pub fn top_files(&self, limit: usize) -> Result<Vec<TopFileStat>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, original_name, download_count, file_size
             FROM files WHERE download_count > 0
             ORDER BY download_count DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(TopFileStat {
                id: row.get(0)?,
                file_name: row.get(1)?,
                downloads: row.get(2)?,
                size: row.get(3)?,
            })
        })?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            original_name TEXT NOT NULL,
            stored_name TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            mime_type TEXT NOT NULL,
            download_count INTEGER NOT NULL DEFAULT 0,
            download_limit INTEGER,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );",
    )
    .context("failed to initialize database schema")
}

fn row_to_record(row: &Row) -> rusqlite::Result<FileRecord> {
    let created_at: String = row.get(9)?;
    let created_at = created_at
        .parse::<DateTime<Utc>>()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(FileRecord {
        id: row.get(0)?,
        original_name: row.get(1)?,
        stored_name: row.get(2)?,
        password_hash: row.get(3)?,
        file_size: row.get(4)?,
        mime_type: row.get(5)?,
        download_count: row.get(6)?,
        download_limit: row.get(7)?,
        is_enabled: row.get(8)?,
        created_at,
    })
}
