//! Metadata Store: persistent mapping from `api_path` to attribute map, pin
//! flag, size, and source path.
//!
//! Two physical implementations are provided: [`SledMetadataStore`] (LSM, the
//! default) and [`SqliteMetadataStore`] (relational). Both are driven through
//! `spawn_blocking` since their underlying I/O is synchronous.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tracing::warn;

use crate::attributes::AttributeMap;
use crate::error::{ApiError, ApiResult};
use crate::path::ApiPath;
use crate::provider::StopFlag;

/// Logical contract both physical stores implement. The File Manager and
/// Provider depend only on this trait.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Drop every row. Called by `Provider::start`'s reconciliation exactly
    /// once, before reinserting a freshly enumerated full listing.
    async fn clear(&self) -> ApiResult<()>;

    /// Insert or fully replace the row for `path`.
    async fn upsert_item(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()>;

    async fn remove_item(&self, path: &ApiPath) -> ApiResult<()>;

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap>;

    async fn get_item_meta_one(&self, path: &ApiPath, key: &str) -> ApiResult<Option<String>> {
        Ok(self.get_item_meta(path).await?.get(key).map(str::to_string))
    }

    async fn set_item_meta_one(&self, path: &ApiPath, key: &str, value: &str) -> ApiResult<()>;

    /// Merge every key in `meta` into the existing row for `path`.
    async fn set_item_meta(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()>;

    async fn remove_item_meta(&self, path: &ApiPath, key: &str) -> ApiResult<()>;

    async fn get_pinned(&self, path: &ApiPath) -> ApiResult<bool> {
        Ok(self.get_item_meta(path).await?.pinned())
    }

    async fn set_pinned(&self, path: &ApiPath, pinned: bool) -> ApiResult<()> {
        self.set_item_meta_one(path, "pinned", if pinned { "1" } else { "0" }).await
    }

    async fn get_api_path_by_source_path(&self, source_path: &str) -> ApiResult<Option<ApiPath>>;

    /// Atomically move the row (and every column) from `from` to `to`.
    async fn rename_item_meta(&self, from: &ApiPath, to: &ApiPath) -> ApiResult<()>;

    /// Enumerate every known `api_path`, calling `callback` once per row.
    /// Checked against `stop` between rows so a long enumeration can be
    /// cancelled promptly on shutdown.
    async fn enumerate_api_paths(
        &self,
        callback: &mut (dyn FnMut(ApiPath) + Send),
        stop: &StopFlag,
    ) -> ApiResult<()>;

    async fn get_total_item_count(&self) -> ApiResult<u64>;

    async fn get_total_size(&self) -> ApiResult<u64>;

    async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>>;
}

fn blocking_join_error(_: tokio::task::JoinError) -> ApiError {
    ApiError::Error
}

// ---------------------------------------------------------------------
// sled-backed implementation
// ---------------------------------------------------------------------

/// LSM-backed implementation, the default. One `sled::Tree` keyed by
/// `api_path`, value is the JSON-serialized [`AttributeMap`].
pub struct SledMetadataStore {
    db: sled::Db,
}

impl SledMetadataStore {
    pub fn open(path: &Path) -> ApiResult<Self> {
        let db = sled::open(path).map_err(|err| {
            warn!(%err, "failed to open sled metadata store");
            ApiError::Error
        })?;
        Ok(Self { db })
    }

    fn encode(meta: &AttributeMap) -> ApiResult<Vec<u8>> {
        serde_json::to_vec(meta).map_err(|_| ApiError::Error)
    }

    fn decode(bytes: &[u8]) -> ApiResult<AttributeMap> {
        serde_json::from_slice(bytes).map_err(|_| ApiError::Error)
    }
}

#[async_trait]
impl MetadataStore for SledMetadataStore {
    async fn clear(&self) -> ApiResult<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.clear().map_err(|_| ApiError::Error))
            .await
            .map_err(blocking_join_error)?
    }

    async fn upsert_item(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let db = self.db.clone();
        let key = path.as_str().to_string();
        let value = Self::encode(meta)?;
        tokio::task::spawn_blocking(move || {
            db.insert(key.as_bytes(), value).map(|_| ()).map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
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

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap> {
        let db = self.db.clone();
        let key = path.as_str().to_string();
        let raw = tokio::task::spawn_blocking(move || db.get(key.as_bytes()))
            .await
            .map_err(blocking_join_error)?
            .map_err(|_| ApiError::Error)?;
        match raw {
            Some(bytes) => Self::decode(&bytes),
            None => Err(ApiError::ItemNotFound),
        }
    }

    async fn set_item_meta_one(&self, path: &ApiPath, key: &str, value: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(path).await.unwrap_or_default();
        meta.set(key, value);
        self.upsert_item(path, &meta).await
    }

    async fn set_item_meta(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let mut existing = self.get_item_meta(path).await.unwrap_or_default();
        for (k, v) in meta.iter() {
            existing.set(k, v);
        }
        self.upsert_item(path, &existing).await
    }

    async fn remove_item_meta(&self, path: &ApiPath, key: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(path).await?;
        if meta.remove(key).is_none() {
            return Err(ApiError::XattrNotFound);
        }
        self.upsert_item(path, &meta).await
    }

    async fn get_api_path_by_source_path(&self, source_path: &str) -> ApiResult<Option<ApiPath>> {
        let db = self.db.clone();
        let needle = source_path.to_string();
        let found = tokio::task::spawn_blocking(move || {
            for entry in db.iter() {
                let (key, value) = entry.map_err(|_| ApiError::Error)?;
                let meta = Self::decode(&value)?;
                if meta.source() == Some(needle.as_str()) {
                    let api_path = String::from_utf8_lossy(&key).to_string();
                    return Ok::<_, ApiError>(Some(api_path));
                }
            }
            Ok(None)
        })
        .await
        .map_err(blocking_join_error)??;
        Ok(found.and_then(|s| ApiPath::new(&s)))
    }

    async fn rename_item_meta(&self, from: &ApiPath, to: &ApiPath) -> ApiResult<()> {
        let db = self.db.clone();
        let from_key = from.as_str().to_string();
        let to_key = to.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            db.transaction(|tx| {
                let value = tx
                    .get(from_key.as_bytes())?
                    .ok_or_else(|| {
                        sled::transaction::ConflictableTransactionError::Abort(())
                    })?;
                tx.insert(to_key.as_bytes(), value)?;
                tx.remove(from_key.as_bytes())?;
                Ok(())
            })
            .map_err(|_: sled::transaction::TransactionError<()>| ApiError::ItemNotFound)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn enumerate_api_paths(
        &self,
        callback: &mut (dyn FnMut(ApiPath) + Send),
        stop: &StopFlag,
    ) -> ApiResult<()> {
        for entry in self.db.iter() {
            if stop.is_stopped() {
                return Ok(());
            }
            let (key, _) = entry.map_err(|_| ApiError::Error)?;
            if let Some(api_path) = ApiPath::new(&String::from_utf8_lossy(&key)) {
                callback(api_path);
            }
        }
        Ok(())
    }

    async fn get_total_item_count(&self) -> ApiResult<u64> {
        Ok(self.db.len() as u64)
    }

    async fn get_total_size(&self) -> ApiResult<u64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut total = 0u64;
            for entry in db.iter() {
                let (_, value) = entry.map_err(|_| ApiError::Error)?;
                total += Self::decode(&value)?.size();
            }
            Ok(total)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in db.iter() {
                let (key, value) = entry.map_err(|_| ApiError::Error)?;
                if Self::decode(&value)?.pinned() {
                    if let Some(api_path) = ApiPath::new(&String::from_utf8_lossy(&key)) {
                        out.push(api_path);
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(blocking_join_error)?
    }
}

// ---------------------------------------------------------------------
// rusqlite-backed implementation
// ---------------------------------------------------------------------

/// Relational implementation: a single `metadata_items` table with the
/// attribute map stored as a JSON column plus indexed `pinned`/`size`/
/// `source_path` columns for the queries that need them without a full scan.
pub struct SqliteMetadataStore {
    conn: Arc<StdMutex<rusqlite::Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(path: &Path) -> ApiResult<Self> {
        let conn = rusqlite::Connection::open(path).map_err(|_| ApiError::Error)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata_items (
                api_path TEXT PRIMARY KEY,
                attributes TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                source_path TEXT
            );
            CREATE INDEX IF NOT EXISTS metadata_items_source_path
                ON metadata_items(source_path);",
        )
        .map_err(|_| ApiError::Error)?;
        Ok(Self { conn: Arc::new(StdMutex::new(conn)) })
    }

    fn row_columns(meta: &AttributeMap) -> (bool, u64, Option<String>) {
        (meta.pinned(), meta.size(), meta.source().map(str::to_string))
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn clear(&self) -> ApiResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute("DELETE FROM metadata_items", [])
                .map(|_| ())
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn upsert_item(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let conn = self.conn.clone();
        let api_path = path.as_str().to_string();
        let attrs = serde_json::to_string(meta).map_err(|_| ApiError::Error)?;
        let (pinned, size, source_path) = Self::row_columns(meta);
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute(
                    "INSERT INTO metadata_items (api_path, attributes, pinned, size, source_path)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(api_path) DO UPDATE SET
                        attributes = excluded.attributes,
                        pinned = excluded.pinned,
                        size = excluded.size,
                        source_path = excluded.source_path",
                    rusqlite::params![api_path, attrs, pinned as i64, size as i64, source_path],
                )
                .map(|_| ())
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn remove_item(&self, path: &ApiPath) -> ApiResult<()> {
        let conn = self.conn.clone();
        let api_path = path.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .execute("DELETE FROM metadata_items WHERE api_path = ?1", [api_path])
                .map(|_| ())
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap> {
        let conn = self.conn.clone();
        let api_path = path.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let attrs: Option<String> = conn
                .query_row(
                    "SELECT attributes FROM metadata_items WHERE api_path = ?1",
                    [api_path],
                    |row| row.get(0),
                )
                .ok();
            match attrs {
                Some(text) => serde_json::from_str(&text).map_err(|_| ApiError::Error),
                None => Err(ApiError::ItemNotFound),
            }
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn set_item_meta_one(&self, path: &ApiPath, key: &str, value: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(path).await.unwrap_or_default();
        meta.set(key, value);
        self.upsert_item(path, &meta).await
    }

    async fn set_item_meta(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let mut existing = self.get_item_meta(path).await.unwrap_or_default();
        for (k, v) in meta.iter() {
            existing.set(k, v);
        }
        self.upsert_item(path, &existing).await
    }

    async fn remove_item_meta(&self, path: &ApiPath, key: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(path).await?;
        if meta.remove(key).is_none() {
            return Err(ApiError::XattrNotFound);
        }
        self.upsert_item(path, &meta).await
    }

    async fn get_api_path_by_source_path(&self, source_path: &str) -> ApiResult<Option<ApiPath>> {
        let conn = self.conn.clone();
        let needle = source_path.to_string();
        let found = tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .query_row(
                    "SELECT api_path FROM metadata_items WHERE source_path = ?1",
                    [needle],
                    |row| row.get::<_, String>(0),
                )
                .ok()
        })
        .await
        .map_err(blocking_join_error)?;
        Ok(found.and_then(|s| ApiPath::new(&s)))
    }

    async fn rename_item_meta(&self, from: &ApiPath, to: &ApiPath) -> ApiResult<()> {
        let conn = self.conn.clone();
        let from_path = from.as_str().to_string();
        let to_path = to.as_str().to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().map_err(|_| ApiError::Error)?;
            let changed = tx
                .execute(
                    "UPDATE metadata_items SET api_path = ?1 WHERE api_path = ?2",
                    rusqlite::params![to_path, from_path],
                )
                .map_err(|_| ApiError::Error)?;
            if changed == 0 {
                return Err(ApiError::ItemNotFound);
            }
            tx.commit().map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn enumerate_api_paths(
        &self,
        callback: &mut (dyn FnMut(ApiPath) + Send),
        stop: &StopFlag,
    ) -> ApiResult<()> {
        let conn = self.conn.clone();
        let paths = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT api_path FROM metadata_items")
                .map_err(|_| ApiError::Error)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|_| ApiError::Error)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|_| ApiError::Error)?);
            }
            Ok::<_, ApiError>(out)
        })
        .await
        .map_err(blocking_join_error)??;

        for raw in paths {
            if stop.is_stopped() {
                break;
            }
            if let Some(api_path) = ApiPath::new(&raw) {
                callback(api_path);
            }
        }
        Ok(())
    }

    async fn get_total_item_count(&self) -> ApiResult<u64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .query_row("SELECT COUNT(*) FROM metadata_items", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u64)
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn get_total_size(&self) -> ApiResult<u64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            conn.lock()
                .unwrap()
                .query_row("SELECT COALESCE(SUM(size), 0) FROM metadata_items", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as u64)
                .map_err(|_| ApiError::Error)
        })
        .await
        .map_err(blocking_join_error)?
    }

    async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
        let conn = self.conn.clone();
        let paths = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT api_path FROM metadata_items WHERE pinned = 1")
                .map_err(|_| ApiError::Error)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|_| ApiError::Error)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|_| ApiError::Error)?);
            }
            Ok::<_, ApiError>(out)
        })
        .await
        .map_err(blocking_join_error)??;
        Ok(paths.into_iter().filter_map(|s| ApiPath::new(&s)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn MetadataStore) {
        let a = ApiPath::new("/a.bin").unwrap();
        let mut meta = AttributeMap::new();
        meta.set_size(5);
        store.upsert_item(&a, &meta).await.unwrap();

        assert_eq!(store.get_item_meta(&a).await.unwrap().size(), 5);
        assert_eq!(store.get_total_item_count().await.unwrap(), 1);
        assert_eq!(store.get_total_size().await.unwrap(), 5);

        store.set_pinned(&a, true).await.unwrap();
        assert!(store.get_pinned(&a).await.unwrap());
        assert_eq!(store.get_pinned_files().await.unwrap(), vec![a.clone()]);

        let b = ApiPath::new("/b.bin").unwrap();
        store.rename_item_meta(&a, &b).await.unwrap();
        assert_eq!(store.get_item_meta(&a).await.unwrap_err(), ApiError::ItemNotFound);
        assert!(store.get_pinned(&b).await.unwrap());

        store.remove_item(&b).await.unwrap();
        assert_eq!(store.get_total_item_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sled_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledMetadataStore::open(&dir.path().join("meta")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteMetadataStore::open(&dir.path().join("meta.db")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn enumerate_api_paths_respects_stop() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledMetadataStore::open(&dir.path().join("meta")).unwrap();
        for i in 0..5 {
            let path = ApiPath::new(&format!("/f{i}")).unwrap();
            store.upsert_item(&path, &AttributeMap::new()).await.unwrap();
        }
        let stop = StopFlag::new();
        stop.stop();
        let mut seen = 0;
        store.enumerate_api_paths(&mut |_| seen += 1, &stop).await.unwrap();
        assert_eq!(seen, 0);
    }
}
