//! File DB: persistent mapping between `api_path`, `source_path`, and
//! per-file encryption parameters (§4.2, §3 "File DB").
//!
//! Only the encrypted-passthrough provider variant populates `iv_list` and
//! the KDF configs; other variants still use this store for the
//! `api_path <-> source_path` mapping and the directory flag.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::path::ApiPath;

/// One KDF configuration (used for either name encryption or data
/// encryption -- a file has one of each, per spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfConfig {
    pub algorithm: String,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

/// One row of the File DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDbRow {
    pub api_path: String,
    pub directory: bool,
    pub source_path: Option<String>,
    /// Per-chunk IV, present only for encrypted providers.
    pub iv_list: Vec<Vec<u8>>,
    pub name_kdf: Option<KdfConfig>,
    pub data_kdf: Option<KdfConfig>,
}

impl FileDbRow {
    pub fn new_directory(api_path: &ApiPath) -> Self {
        Self {
            api_path: api_path.as_str().to_string(),
            directory: true,
            source_path: None,
            iv_list: Vec::new(),
            name_kdf: None,
            data_kdf: None,
        }
    }

    pub fn new_file(api_path: &ApiPath, source_path: Option<String>) -> Self {
        Self {
            api_path: api_path.as_str().to_string(),
            directory: false,
            source_path,
            iv_list: Vec::new(),
            name_kdf: None,
            data_kdf: None,
        }
    }
}

#[async_trait]
pub trait FileDb: Send + Sync {
    async fn add_or_update_directory(&self, row: FileDbRow) -> ApiResult<()>;
    async fn add_or_update_file(&self, row: FileDbRow) -> ApiResult<()>;
    async fn remove_item(&self, path: &ApiPath) -> ApiResult<()>;
    async fn get_item_by_api_path(&self, path: &ApiPath) -> ApiResult<FileDbRow>;
    async fn get_api_path_by_source_path(&self, source_path: &str) -> ApiResult<Option<ApiPath>>;
    async fn enumerate_item_list(&self) -> ApiResult<Vec<FileDbRow>>;
    async fn clear(&self) -> ApiResult<()>;
    async fn count(&self) -> ApiResult<u64>;
}

fn blocking_join_error(_: tokio::task::JoinError) -> ApiError {
    ApiError::Error
}

// ---------------------------------------------------------------------
// sled-backed implementation
// ---------------------------------------------------------------------

pub struct SledFileDb {
    db: sled::Db,
}

impl SledFileDb {
    pub fn open(path: &Path) -> ApiResult<Self> {
        let db = sled::open(path).map_err(|err| {
            warn!(%err, "failed to open sled file db");
            ApiError::Error
        })?;
        Ok(Self { db })
    }

    fn put(&self, row: FileDbRow) -> ApiResult<()> {
        let key = row.api_path.clone();
        let bytes = serde_json::to_vec(&row).map_err(|_| ApiError::Error)?;
        self.db.insert(key.as_bytes(), bytes).map(|_| ()).map_err(|_| ApiError::Error)
    }
}

#[async_trait]
impl FileDb for SledFileDb {
    async fn add_or_update_directory(&self, row: FileDbRow) -> ApiResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || Self { db }.put(row))
            .await
            .map_err(blocking_join_error)?
    }

    async fn add_or_update_file(&self, row: FileDbRow) -> ApiResult<()> {
        self.add_or_update_directory(row).await
    }

    async fn remove_item(&self, path: &ApiPath) -> ApiResult<()> {
        let db = self.db.clone();
        let key = path.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            db.remove(key.as_bytes()).map(|_| ()).map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn get_item_by_api_path(&self, path: &ApiPath) -> ApiResult<FileDbRow> {
        let db = self.db.clone();
        let key = path.as_str().to_string();
        let raw = tokio::task::spawn_blocking(move || db.get(key.as_bytes()))
            .await
            .map_err(blocking_join_error)?
            .map_err(|_| ApiError::Error)?;
        match raw {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|_| ApiError::Error),
            None => Err(ApiError::ItemNotFound),
        }
    }

    async fn get_api_path_by_source_path(&self, source_path: &str) -> ApiResult<Option<ApiPath>> {
        let db = self.db.clone();
        let needle = source_path.to_string();
        let found = tokio::task::spawn_blocking(move || {
            for entry in db.iter() {
                let (_, value) = entry.map_err(|_| ApiError::Error)?;
                let row: FileDbRow = serde_json::from_slice(&value).map_err(|_| ApiError::Error)?;
                if row.source_path.as_deref() == Some(needle.as_str()) {
                    return Ok::<_, ApiError>(Some(row.api_path));
                }
            }
            Ok(None)
        })
        .await
        .map_err(blocking_join_error)??;
        Ok(found.and_then(|s| ApiPath::new(&s)))
    }

    async fn enumerate_item_list(&self) -> ApiResult<Vec<FileDbRow>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in db.iter() {
                let (_, value) = entry.map_err(|_| ApiError::Error)?;
                out.push(serde_json::from_slice(&value).map_err(|_| ApiError::Error)?);
            }
            Ok(out)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn clear(&self) -> ApiResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.clear().map_err(|_| ApiError::Error))
            .await
            .map_err(blocking_join_error)?
    }

    async fn count(&self) -> ApiResult<u64> {
        Ok(self.db.len() as u64)
    }
}

// ---------------------------------------------------------------------
// rusqlite-backed implementation
// ---------------------------------------------------------------------

pub struct SqliteFileDb {
    conn: Arc<StdMutex<rusqlite::Connection>>,
}

impl SqliteFileDb {
    pub fn open(path: &Path) -> ApiResult<Self> {
        let conn = rusqlite::Connection::open(path).map_err(|_| ApiError::Error)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS file_db_items (
                api_path TEXT PRIMARY KEY,
                directory INTEGER NOT NULL,
                source_path TEXT,
                iv_list TEXT NOT NULL,
                name_kdf TEXT,
                data_kdf TEXT
            );
            CREATE INDEX IF NOT EXISTS file_db_items_source_path
                ON file_db_items(source_path);",
        )
        .map_err(|_| ApiError::Error)?;
        Ok(Self { conn: Arc::new(StdMutex::new(conn)) })
    }

    fn put(conn: &rusqlite::Connection, row: &FileDbRow) -> ApiResult<()> {
        let iv_list = serde_json::to_string(&row.iv_list).map_err(|_| ApiError::Error)?;
        let name_kdf = row
            .name_kdf
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|_| ApiError::Error)?;
        let data_kdf = row
            .data_kdf
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|_| ApiError::Error)?;
        conn.execute(
            "INSERT INTO file_db_items (api_path, directory, source_path, iv_list, name_kdf, data_kdf)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(api_path) DO UPDATE SET
                directory = excluded.directory,
                source_path = excluded.source_path,
                iv_list = excluded.iv_list,
                name_kdf = excluded.name_kdf,
                data_kdf = excluded.data_kdf",
            rusqlite::params![row.api_path, row.directory as i64, row.source_path, iv_list, name_kdf, data_kdf],
        )
        .map(|_| ())
        .map_err(|_| ApiError::Error)
    }

    fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileDbRow> {
        let iv_list_text: String = row.get(3)?;
        let name_kdf_text: Option<String> = row.get(4)?;
        let data_kdf_text: Option<String> = row.get(5)?;
        Ok(FileDbRow {
            api_path: row.get(0)?,
            directory: row.get::<_, i64>(1)? != 0,
            source_path: row.get(2)?,
            iv_list: serde_json::from_str(&iv_list_text).unwrap_or_default(),
            name_kdf: name_kdf_text.and_then(|t| serde_json::from_str(&t).ok()),
            data_kdf: data_kdf_text.and_then(|t| serde_json::from_str(&t).ok()),
        })
    }
}

#[async_trait]
impl FileDb for SqliteFileDb {
    async fn add_or_update_directory(&self, row: FileDbRow) -> ApiResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::put(&conn.lock().unwrap(), &row))
            .await
            .map_err(blocking_join_error)?
    }

    async fn add_or_update_file(&self, row: FileDbRow) -> ApiResult<()> {
        self.add_or_update_directory(row).await
    }

    async fn remove_item(&self, path: &ApiPath) -> ApiResult<()> {
        let conn = self.conn.clone();
        let api_path = path.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute("DELETE FROM file_db_items WHERE api_path = ?1", [api_path])
                .map(|_| ())
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn get_item_by_api_path(&self, path: &ApiPath) -> ApiResult<FileDbRow> {
        let conn = self.conn.clone();
        let api_path = path.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .query_row(
                    "SELECT api_path, directory, source_path, iv_list, name_kdf, data_kdf
                     FROM file_db_items WHERE api_path = ?1",
                    [api_path],
                    Self::row_from_sql,
                )
                .map_err(|_| ApiError::ItemNotFound)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn get_api_path_by_source_path(&self, source_path: &str) -> ApiResult<Option<ApiPath>> {
        let conn = self.conn.clone();
        let needle = source_path.to_string();
        let found = tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .query_row(
                    "SELECT api_path FROM file_db_items WHERE source_path = ?1",
                    [needle],
                    |row| row.get::<_, String>(0),
                )
                .ok()
        })
        .await
        .map_err(blocking_join_error)?;
        Ok(found.and_then(|s| ApiPath::new(&s)))
    }

    async fn enumerate_item_list(&self) -> ApiResult<Vec<FileDbRow>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT api_path, directory, source_path, iv_list, name_kdf, data_kdf FROM file_db_items")
                .map_err(|_| ApiError::Error)?;
            let rows = stmt.query_map([], Self::row_from_sql).map_err(|_| ApiError::Error)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|_| ApiError::Error)?);
            }
            Ok(out)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn clear(&self) -> ApiResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute("DELETE FROM file_db_items", [])
                .map(|_| ())
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn count(&self) -> ApiResult<u64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .query_row("SELECT COUNT(*) FROM file_db_items", [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(db: &dyn FileDb) {
        let path = ApiPath::new("/a.bin").unwrap();
        let row = FileDbRow::new_file(&path, Some("/cache/uuid-1".into()));
        db.add_or_update_file(row.clone()).await.unwrap();

        let fetched = db.get_item_by_api_path(&path).await.unwrap();
        assert_eq!(fetched.source_path.as_deref(), Some("/cache/uuid-1"));
        assert_eq!(db.count().await.unwrap(), 1);

        let found = db.get_api_path_by_source_path("/cache/uuid-1").await.unwrap();
        assert_eq!(found, Some(path.clone()));

        db.remove_item(&path).await.unwrap();
        assert_eq!(db.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sled_file_db_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledFileDb::open(&dir.path().join("filedb")).unwrap();
        exercise(&db).await;
    }

    #[tokio::test]
    async fn sqlite_file_db_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteFileDb::open(&dir.path().join("filedb.db")).unwrap();
        exercise(&db).await;
    }

    #[tokio::test]
    async fn preserves_iv_list_and_kdf_configs() {
        let dir = tempfile::tempdir().unwrap();
        let db = SledFileDb::open(&dir.path().join("filedb")).unwrap();
        let path = ApiPath::new("/enc.bin").unwrap();
        let mut row = FileDbRow::new_file(&path, Some("/cache/uuid-2".into()));
        row.iv_list = vec![vec![1, 2, 3], vec![4, 5, 6]];
        row.name_kdf = Some(KdfConfig { algorithm: "hkdf-sha256".into(), iterations: 1, salt: vec![9] });
        db.add_or_update_file(row.clone()).await.unwrap();

        let fetched = db.get_item_by_api_path(&path).await.unwrap();
        assert_eq!(fetched.iv_list, row.iv_list);
        assert_eq!(fetched.name_kdf, row.name_kdf);
    }
}
