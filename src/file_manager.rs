//! File Manager (§4.7): the single coordinator owning the Open File table,
//! the handle allocator, the Upload Queue, and the Eviction Hook.
//!
//! Lock order (spec.md §5): `table_lock` (this module's `open_files` mutex)
//! is always acquired before an individual Open File's internal lock, which
//! is acquired before the Upload Queue's, which is acquired before a store
//! transaction; provider I/O never happens while any of those are held. Every
//! method below that touches more than one of these follows that order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::accountant::CacheAccountant;
use crate::attributes::AttributeMap;
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::eviction::{EvictionCandidate, EvictionHook};
use crate::events::{Event, EventBus};
use crate::item::FilesystemItem;
use crate::openfile::bitset::ChunkBitset;
use crate::openfile::{Handle, OpenFile, OpenFileParams, OpenFlags};
use crate::path::ApiPath;
use crate::poller::Poller;
use crate::provider::{ApiFile, Provider, ReconcileSink, StopFlag};
use crate::store::file_db::FileDbRow;
use crate::store::{FileDb, MetadataStore};
use crate::upload_queue::UploadQueue;

const RESUME_STATE_KEY: &str = "resume_state";

/// JSON payload stashed under [`RESUME_STATE_KEY`] for an incomplete
/// download that was still open at shutdown.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeState {
    chunk_size: u64,
    last_chunk_size: u64,
    read_state: Vec<bool>,
}

/// Local-only state for one path that a full re-enumeration must not lose,
/// captured right before `start` clears the stores and consulted by
/// `on_item_discovered` as each path is rediscovered. Reconciliation only
/// learns what the provider has; it has no way to rediscover which cache
/// file backs a path or what resume/pinned state was recorded for it, so
/// that has to survive the clear out-of-band.
struct PreservedRow {
    source_path: Option<String>,
    pinned: bool,
    resume_state: Option<String>,
}

pub struct FileManager {
    provider: Arc<dyn Provider>,
    metadata: Arc<dyn MetadataStore>,
    file_db: Arc<dyn FileDb>,
    events: EventBus,
    config: Config,
    accountant: std::sync::OnceLock<Arc<CacheAccountant>>,
    open_files: tokio::sync::Mutex<HashMap<ApiPath, Arc<OpenFile>>>,
    handle_owner: tokio::sync::Mutex<HashMap<Handle, ApiPath>>,
    next_handle: AtomicU64,
    uploads: std::sync::OnceLock<Arc<UploadQueue>>,
    poller: std::sync::OnceLock<Poller>,
    stop: StopFlag,
    restart_snapshot: tokio::sync::Mutex<HashMap<ApiPath, PreservedRow>>,
}

impl FileManager {
    pub fn new(
        provider: Arc<dyn Provider>,
        metadata: Arc<dyn MetadataStore>,
        file_db: Arc<dyn FileDb>,
        events: EventBus,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            metadata,
            file_db,
            events,
            config,
            accountant: std::sync::OnceLock::new(),
            open_files: tokio::sync::Mutex::new(HashMap::new()),
            handle_owner: tokio::sync::Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            uploads: std::sync::OnceLock::new(),
            poller: std::sync::OnceLock::new(),
            stop: StopFlag::new(),
            restart_snapshot: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    fn accountant(&self) -> &Arc<CacheAccountant> {
        self.accountant.get().expect("start() must run before any other FileManager method")
    }

    fn uploads(&self) -> &Arc<UploadQueue> {
        self.uploads.get().expect("start() must run before any other FileManager method")
    }

    fn open_file_params(&self) -> OpenFileParams {
        OpenFileParams {
            chunk_size: self.config.chunk_size,
            read_ahead_count: self.config.read_ahead_count,
            read_behind_count: self.config.read_behind_count,
            read_end_count: self.config.read_end_count,
            chunk_timeout: self.config.chunk_timeout,
            access_time_tracking: self.config.access_time_tracking,
        }
    }

    fn allocate_handle(&self) -> Handle {
        loop {
            let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
            if handle != 0 {
                return handle;
            }
        }
    }

    // -- startup / shutdown -------------------------------------------------

    /// Snapshot every path's `source_path`, `pinned` flag, and pending resume
    /// state before a full re-sync clears the stores (SPEC_FULL §B.5):
    /// reconciliation only learns what the provider has, so anything the
    /// stores know that the provider doesn't expose -- which local cache file
    /// backs a path, whether it's pinned, whether a download was left
    /// incomplete -- would otherwise be lost the moment `clear()` runs.
    async fn capture_restart_snapshot(&self) {
        let mut snapshot = HashMap::new();
        if let Ok(rows) = self.file_db.enumerate_item_list().await {
            for row in rows {
                let Some(api_path) = ApiPath::new(&row.api_path) else { continue };
                let resume_state = self.metadata.get_item_meta_one(&api_path, RESUME_STATE_KEY).await.ok().flatten();
                let pinned = self.metadata.get_pinned(&api_path).await.unwrap_or(false);
                snapshot.insert(api_path, PreservedRow { source_path: row.source_path, pinned, resume_state });
            }
        }
        *self.restart_snapshot.lock().await = snapshot;
    }

    /// Bring the manager online: version-gate the provider, scan the cache
    /// directory, reconcile the provider's namespace into the stores, and
    /// start the Upload Queue worker and the eviction poller.
    pub async fn start(self: &Arc<Self>) -> ApiResult<()> {
        self.events.publish(Event::ServiceStartBegin);

        let (major, _minor) = self.provider.check_version().await?;
        if major < self.config.required_provider_version {
            return Err(ApiError::IncompatibleVersion);
        }

        let accountant =
            Arc::new(CacheAccountant::scan(&self.config.cache_directory, self.config.cache_size_limit).await.map_err(ApiError::from)?);
        let _ = self.accountant.set(accountant.clone());

        let uploads = UploadQueue::new(self.provider.clone(), self.events.clone(), &self.config);
        uploads.start();
        let _ = self.uploads.set(uploads);

        self.capture_restart_snapshot().await;
        self.metadata.clear().await?;
        self.file_db.clear().await?;

        let sink: Arc<dyn ReconcileSink> = self.clone();
        let started = self.provider.start(sink, &self.stop).await?;
        if !started {
            warn!("provider start was cancelled");
            return Ok(());
        }

        let poller = Poller::new(self.events.clone());
        let eviction_interval = self.config.eviction_poll_interval;
        let this = self.clone();
        poller.register("cache-eviction", eviction_interval, move || {
            let this = this.clone();
            async move { this.run_eviction_sweep().await }
        });
        let _ = self.poller.set(poller);

        self.events.publish(Event::ServiceStartEnd);
        self.events.publish(Event::DriveMounted);
        Ok(())
    }

    /// Refuse new operations, drain the Upload Queue with a bounded deadline,
    /// persist resume state for every incomplete Open File, and stop the
    /// provider and pollers.
    pub async fn stop(self: &Arc<Self>) {
        self.events.publish(Event::ServiceStopBegin);
        self.stop.stop();

        if let Some(poller) = self.poller.get() {
            poller.stop();
        }
        if let Some(uploads) = self.uploads.get() {
            uploads.drain(Duration::from_secs(30)).await;
            uploads.stop();
        }

        let open_files = self.open_files.lock().await;
        for (api_path, open_file) in open_files.iter() {
            if open_file.is_complete().await {
                let _ = self.metadata.remove_item_meta(api_path, RESUME_STATE_KEY).await;
                continue;
            }
            let snapshot = open_file.resume_snapshot().await;
            let state = ResumeState {
                chunk_size: snapshot.chunk_size,
                last_chunk_size: snapshot.last_chunk_size,
                read_state: snapshot.read_state,
            };
            if let Ok(json) = serde_json::to_string(&state) {
                let _ = self.metadata.set_item_meta_one(api_path, RESUME_STATE_KEY, &json).await;
                self.events.publish(Event::DownloadResumeAdded { api_path: api_path.to_string() });
            }
        }
        drop(open_files);

        self.provider.stop().await;
        self.events.publish(Event::DriveUnmounted);
        self.events.publish(Event::ServiceStopEnd);
    }

    // -- open / create / close ----------------------------------------------

    /// Open (or create, with `flags.create`) `api_path` for I/O and return a
    /// fresh handle onto it.
    pub async fn open(self: &Arc<Self>, api_path: &ApiPath, flags: OpenFlags) -> ApiResult<Handle> {
        let existing = {
            let table = self.open_files.lock().await;
            table.get(api_path).cloned()
        };
        let open_file = match existing {
            Some(open_file) => open_file,
            None => {
                // Built without holding `table_lock` -- it does provider and
                // store I/O, which must never run under that lock.
                let built = self.load_or_create_open_file(api_path, flags).await?;
                let mut table = self.open_files.lock().await;
                table.entry(api_path.clone()).or_insert(built).clone()
            }
        };

        let handle = self.allocate_handle();
        open_file.add(handle, flags).await;
        self.handle_owner.lock().await.insert(handle, api_path.clone());
        Ok(handle)
    }

    async fn load_or_create_open_file(
        &self,
        api_path: &ApiPath,
        flags: OpenFlags,
    ) -> ApiResult<Arc<OpenFile>> {
        let existing_meta = self.metadata.get_item_meta(api_path).await;
        let meta = match existing_meta {
            Ok(meta) => meta,
            Err(ApiError::ItemNotFound) if flags.create => {
                self.provider.create_file(api_path, &AttributeMap::new()).await?;
                let meta = AttributeMap::new();
                self.metadata.upsert_item(api_path, &meta).await?;
                meta
            }
            // Not in the local view but the provider has it -- e.g. an item
            // written by another client since the last full reconciliation.
            // Live-fetch and lazily populate the Metadata Store rather than
            // failing the open outright.
            Err(ApiError::ItemNotFound) => {
                let meta = self.provider.get_item_meta(api_path).await?;
                self.metadata.upsert_item(api_path, &meta).await?;
                meta
            }
            Err(err) => return Err(err),
        };

        let row = match self.file_db.get_item_by_api_path(api_path).await {
            Ok(row) => row,
            Err(ApiError::ItemNotFound) => {
                let row = FileDbRow::new_file(api_path, None);
                self.file_db.add_or_update_file(row.clone()).await?;
                row
            }
            Err(err) => return Err(err),
        };

        let source_path = match row.source_path.clone() {
            Some(path) => PathBuf::from(path),
            None => {
                let generated = self.config.cache_directory.join(Uuid::new_v4().to_string());
                let mut updated = row.clone();
                updated.source_path = Some(generated.to_string_lossy().to_string());
                self.file_db.add_or_update_file(updated).await?;
                generated
            }
        };

        let size = meta.size();
        if tokio::fs::metadata(&source_path).await.is_err() {
            let file = tokio::fs::File::create(&source_path).await.map_err(ApiError::from)?;
            file.set_len(size).await.map_err(ApiError::from)?;
            self.accountant().update(0, size, false);
        }

        let resume_state = self.metadata.get_item_meta_one(api_path, RESUME_STATE_KEY).await.ok().flatten();
        let read_state = resume_state.as_deref().and_then(|json| serde_json::from_str::<ResumeState>(json).ok());
        if read_state.is_some() {
            let _ = self.metadata.remove_item_meta(api_path, RESUME_STATE_KEY).await;
            self.events.publish(Event::DownloadRestored { api_path: api_path.to_string() });
            self.events.publish(Event::DownloadResumeRemoved { api_path: api_path.to_string() });
        }

        let mut item = FilesystemItem::new_file(api_path.clone());
        item.size = size;
        item.attributes = meta;
        item.set_source_path(source_path.clone());

        Ok(Arc::new(OpenFile::new(
            &item,
            source_path,
            self.provider.clone(),
            self.metadata.clone(),
            self.events.clone(),
            self.accountant().clone(),
            self.open_file_params(),
            read_state.map(|s| ChunkBitset::from_bools(&s.read_state)),
        )))
    }

    /// Create a directory or an empty file without opening it.
    pub async fn create(&self, api_path: &ApiPath, directory: bool, meta: &AttributeMap) -> ApiResult<()> {
        if directory {
            self.provider.create_directory(api_path, meta).await?;
            self.metadata.upsert_item(api_path, meta).await?;
            self.file_db.add_or_update_directory(FileDbRow::new_directory(api_path)).await?;
        } else {
            self.provider.create_file(api_path, meta).await?;
            self.metadata.upsert_item(api_path, meta).await?;
            self.file_db.add_or_update_file(FileDbRow::new_file(api_path, None)).await?;
        }
        Ok(())
    }

    /// Release `handle`. Enqueues an upload if that was the last handle on a
    /// dirty, upload-capable file.
    pub async fn close(&self, handle: Handle) -> ApiResult<()> {
        let api_path = self.handle_owner.lock().await.remove(&handle).ok_or(ApiError::InvalidHandle)?;
        let table = self.open_files.lock().await;
        let open_file = table.get(&api_path).cloned();
        drop(table);
        let Some(open_file) = open_file else { return Err(ApiError::InvalidHandle) };

        match open_file.remove(handle).await {
            crate::openfile::CloseOutcome::NeedsUpload => {
                let source_path = open_file.get_source_path().await;
                self.uploads().queue_upload(api_path, source_path).await;
            }
            crate::openfile::CloseOutcome::DirtyDiscarded => {
                warn!(%api_path, "dirty direct-only file discarded on close");
            }
            crate::openfile::CloseOutcome::Unlinked => {
                self.open_files.lock().await.remove(&api_path);
                if let Err(err) = self.delete_item(&api_path).await {
                    warn!(%api_path, %err, "failed to delete unlinked file on last close");
                }
            }
            crate::openfile::CloseOutcome::StillOpen | crate::openfile::CloseOutcome::ClosableClean => {}
        }
        Ok(())
    }

    pub async fn get_open_file(&self, api_path: &ApiPath) -> Option<Arc<OpenFile>> {
        self.open_files.lock().await.get(api_path).cloned()
    }

    /// Force an immediate upload of `api_path`'s current cached content,
    /// regardless of handle count (used by explicit flush/fsync operations).
    pub async fn force_schedule_upload(&self, api_path: &ApiPath) -> ApiResult<()> {
        let open_file = self.get_open_file(api_path).await.ok_or(ApiError::ItemNotFound)?;
        if !open_file.is_modified().await {
            return Ok(());
        }
        let source_path = open_file.get_source_path().await;
        self.uploads().queue_upload(api_path.clone(), source_path).await;
        Ok(())
    }

    // -- rename / remove ------------------------------------------------------

    /// Rename `src` to `dst` (spec.md §4.7, scenario S4). Unlike `remove_file`,
    /// a rename is **not** deferred until close: the provider's rename call
    /// (or, for providers that cannot rename, the copy+delete fallback)
    /// targets the path itself, and an Open File with handles still open on
    /// `src` simply gets re-pointed at `dst` in place -- its source file and
    /// in-flight chunk state are untouched, so readers and the writer that
    /// produced the pending dirty bytes keep working without interruption.
    ///
    /// The copy+delete fallback is only valid with no open handles (§4.1):
    /// the "source path" it uploads from would otherwise be actively mutated
    /// by a concurrent writer mid-copy.
    pub async fn rename_file(&self, src: &ApiPath, dst: &ApiPath) -> ApiResult<()> {
        if src == dst {
            return Ok(());
        }
        if self.provider.is_read_only() {
            return Err(ApiError::PermissionDenied);
        }

        let open_file = {
            let table = self.open_files.lock().await;
            table.get(src).cloned()
        };
        let has_handles = match &open_file {
            Some(open_file) => open_file.handle_count().await > 0,
            None => false,
        };
        if has_handles && !self.provider.supports_rename() {
            return Err(ApiError::NotImplemented);
        }

        // Pause the Upload Queue so a racing upload cannot recreate `src`
        // after the provider rename below (§4.5 "Pause").
        self.uploads().pause().await;
        let result = self.rename_file_inner(src, dst, open_file.as_ref()).await;
        self.uploads().resume().await;
        result
    }

    async fn rename_file_inner(&self, src: &ApiPath, dst: &ApiPath, open_file: Option<&Arc<OpenFile>>) -> ApiResult<()> {
        // Pausing the queue stops new attempts but not one already in
        // flight (§4.5); wait it out so the provider rename below is not
        // racing an upload that would otherwise publish under the old name
        // after we have already moved on (open question #2 in spec.md §9).
        for _ in 0..150 {
            if !self.uploads().is_processing(src).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if self.provider.supports_rename() {
            self.provider.rename_file(src, dst).await?;
        } else {
            let row = self.file_db.get_item_by_api_path(src).await?;
            let source_path = row.source_path.clone().ok_or(ApiError::NotSupported)?;
            self.provider.upload_file(dst, std::path::Path::new(&source_path), &self.stop).await?;
            self.provider.remove_file(src).await?;
        }

        self.metadata.rename_item_meta(src, dst).await?;
        if let Ok(mut row) = self.file_db.get_item_by_api_path(src).await {
            row.api_path = dst.as_str().to_string();
            self.file_db.remove_item(src).await?;
            self.file_db.add_or_update_file(row).await?;
        }
        let _ = self.uploads().rename(src, dst).await;

        if let Some(open_file) = open_file {
            open_file.set_api_path(dst.clone());
        }
        let mut table = self.open_files.lock().await;
        if let Some(open_file) = table.remove(src) {
            table.insert(dst.clone(), open_file);
        }
        Ok(())
    }

    pub async fn rename_directory(&self, src: &ApiPath, dst: &ApiPath) -> ApiResult<()> {
        if src == dst {
            return Ok(());
        }
        if !self.provider.is_directory(src).await? {
            return Err(ApiError::DirectoryNotFound);
        }
        self.provider.create_directory_clone_source_meta(src, dst).await?;

        let mut descendants = Vec::new();
        self.metadata
            .enumerate_api_paths(
                &mut |path| {
                    if path.is_under(src) && &path != src {
                        descendants.push(path);
                    }
                },
                &self.stop,
            )
            .await?;

        for old_path in descendants {
            let suffix = &old_path.as_str()[src.as_str().len()..];
            let new_path = ApiPath::new(&format!("{}{}", dst.as_str(), suffix)).ok_or(ApiError::InvalidOperation)?;
            let is_directory = self
                .file_db
                .get_item_by_api_path(&old_path)
                .await
                .map(|row| row.directory)
                .unwrap_or(false);
            if is_directory {
                self.metadata.rename_item_meta(&old_path, &new_path).await?;
                if let Ok(mut row) = self.file_db.get_item_by_api_path(&old_path).await {
                    row.api_path = new_path.as_str().to_string();
                    self.file_db.remove_item(&old_path).await?;
                    self.file_db.add_or_update_directory(row).await?;
                }
            } else {
                self.rename_file(&old_path, &new_path).await?;
            }
        }

        self.metadata.rename_item_meta(src, dst).await?;
        self.provider.remove_directory(src).await?;
        Ok(())
    }

    /// Remove `api_path`. Per spec.md §4.7, this may be called while handles
    /// are still open: rather than failing with `FileInUse`, the Open File is
    /// marked **unlinked** and the provider delete is deferred to `close` of
    /// its last handle, so concurrent readers on the still-open handles keep
    /// seeing the pre-remove content in the meantime.
    pub async fn remove_file(&self, api_path: &ApiPath) -> ApiResult<()> {
        {
            let mut table = self.open_files.lock().await;
            if let Some(open_file) = table.get(api_path) {
                if open_file.handle_count().await > 0 {
                    open_file.mark_unlinked();
                    self.uploads().remove_upload(api_path).await;
                    return Ok(());
                }
                table.remove(api_path);
            }
        }
        self.delete_item(api_path).await
    }

    /// Delete `api_path`'s provider object, cache copy, and store rows.
    /// Shared by `remove_file` (no open handles) and `close` (last handle of
    /// an unlinked file).
    async fn delete_item(&self, api_path: &ApiPath) -> ApiResult<()> {
        self.uploads().remove_upload(api_path).await;
        self.provider.remove_file(api_path).await?;

        if let Ok(row) = self.file_db.get_item_by_api_path(api_path).await {
            if let Some(source_path) = row.source_path {
                if let Ok(meta) = tokio::fs::metadata(&source_path).await {
                    self.accountant().update(meta.len(), 0, true);
                }
                let _ = tokio::fs::remove_file(&source_path).await;
            }
        }
        self.metadata.remove_item(api_path).await?;
        self.file_db.remove_item(api_path).await?;
        Ok(())
    }

    pub async fn remove_directory(&self, api_path: &ApiPath) -> ApiResult<()> {
        if self.provider.get_directory_item_count(api_path).await? > 0 {
            return Err(ApiError::DirectoryNotEmpty);
        }
        self.provider.remove_directory(api_path).await?;
        self.metadata.remove_item(api_path).await?;
        self.file_db.remove_item(api_path).await?;
        Ok(())
    }

    // -- eviction --------------------------------------------------------------

    async fn run_eviction_sweep(self: &Arc<Self>) {
        if !self.accountant().over_watermark(self.config.eviction_high_watermark) {
            return;
        }
        let rows = match self.file_db.enumerate_item_list().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%err, "eviction sweep could not enumerate file db");
                return;
            }
        };
        let hook = EvictionHook::new(
            self.provider.clone(),
            self.metadata.clone(),
            self.file_db.clone(),
            self.uploads().clone(),
            self.accountant().clone(),
            self.events.clone(),
        );

        for row in rows {
            if !self.accountant().over_watermark(self.config.eviction_high_watermark) {
                break;
            }
            if row.directory {
                continue;
            }
            let Some(source_path) = row.source_path else { continue };
            let Some(api_path) = ApiPath::new(&row.api_path) else { continue };
            let known_size = self.metadata.get_item_meta(&api_path).await.map(|m| m.size()).unwrap_or(u64::MAX);
            let has_resume = self
                .metadata
                .get_item_meta_one(&api_path, RESUME_STATE_KEY)
                .await
                .ok()
                .flatten()
                .is_some();
            let open_file = self.get_open_file(&api_path).await;
            let candidate = EvictionCandidate { api_path: api_path.clone(), source_path: PathBuf::from(source_path), known_size };
            match hook.evict_file(open_file.as_ref(), &candidate, has_resume).await {
                Ok(true) => {
                    let mut table = self.open_files.lock().await;
                    table.remove(&api_path);
                }
                Ok(false) => {}
                Err(err) => warn!(%err, %api_path, "eviction attempt failed"),
            }
        }
    }
}

#[async_trait]
impl ReconcileSink for FileManager {
    async fn on_item_discovered(&self, file: ApiFile) {
        let preserved = self.restart_snapshot.lock().await.remove(&file.api_path);

        let mut meta = AttributeMap::new();
        meta.set_size(file.size);
        if let Some(preserved) = &preserved {
            meta.set_pinned(preserved.pinned);
        }
        if let Err(err) = self.metadata.upsert_item(&file.api_path, &meta).await {
            warn!(%err, api_path = %file.api_path, "failed to record discovered item");
            return;
        }
        if let Some(preserved) = &preserved {
            if let Some(resume_state) = &preserved.resume_state {
                if let Err(err) = self.metadata.set_item_meta_one(&file.api_path, RESUME_STATE_KEY, resume_state).await {
                    warn!(%err, api_path = %file.api_path, "failed to restore resume state");
                }
            }
        }

        let source_path = preserved.as_ref().and_then(|p| p.source_path.clone());
        let row = if file.directory {
            FileDbRow::new_directory(&file.api_path)
        } else {
            FileDbRow::new_file(&file.api_path, source_path)
        };
        if let Err(err) = self.file_db.add_or_update_file(row).await {
            warn!(%err, api_path = %file.api_path, "failed to record discovered item in file db");
        }
    }

    async fn on_reconcile_complete(&self) {
        self.restart_snapshot.lock().await.clear();
        info!("reconciliation complete");
    }

    fn cache_directory(&self) -> PathBuf {
        self.config.cache_directory.clone()
    }

    async fn known_source_paths(&self) -> std::collections::HashSet<PathBuf> {
        self.file_db
            .enumerate_item_list()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| row.source_path.map(PathBuf::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DirectoryItem, FileListPage};
    use crate::store::file_db::SledFileDb;
    use crate::store::metadata_store::SledMetadataStore;
    use std::sync::Mutex as StdMutex;

    struct FakeProvider {
        objects: StdMutex<HashMap<String, Vec<u8>>>,
        rename_supported: bool,
    }

    impl FakeProvider {
        fn new(rename_supported: bool) -> Self {
            Self { objects: StdMutex::new(HashMap::new()), rename_supported }
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn supports_rename(&self) -> bool {
            self.rename_supported
        }

        async fn check_version(&self) -> ApiResult<(u32, u32)> {
            Ok((1, 0))
        }
        async fn create_directory(&self, _: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            Ok(())
        }
        async fn create_file(&self, path: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            self.objects.lock().unwrap().entry(path.as_str().to_string()).or_default();
            Ok(())
        }
        async fn remove_directory(&self, _: &ApiPath) -> ApiResult<()> {
            Ok(())
        }
        async fn remove_file(&self, path: &ApiPath) -> ApiResult<()> {
            self.objects.lock().unwrap().remove(path.as_str());
            Ok(())
        }
        async fn rename_file(&self, src: &ApiPath, dst: &ApiPath) -> ApiResult<()> {
            if !self.rename_supported {
                return Err(ApiError::NotImplemented);
            }
            let mut objects = self.objects.lock().unwrap();
            let data = objects.remove(src.as_str()).ok_or(ApiError::ItemNotFound)?;
            objects.insert(dst.as_str().to_string(), data);
            Ok(())
        }
        async fn is_directory(&self, _: &ApiPath) -> ApiResult<bool> {
            Ok(false)
        }
        async fn is_file(&self, path: &ApiPath) -> ApiResult<bool> {
            Ok(self.objects.lock().unwrap().contains_key(path.as_str()))
        }
        async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap> {
            let objects = self.objects.lock().unwrap();
            let data = objects.get(path.as_str()).ok_or(ApiError::ItemNotFound)?;
            let mut meta = AttributeMap::new();
            meta.set_size(data.len() as u64);
            Ok(meta)
        }
        async fn set_item_meta_one(&self, _: &ApiPath, _: &str, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn set_item_meta(&self, _: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            Ok(())
        }
        async fn remove_item_meta(&self, _: &ApiPath, _: &str) -> ApiResult<()> {
            Ok(())
        }
        async fn get_directory_items(&self, _: &ApiPath) -> ApiResult<Vec<DirectoryItem>> {
            Ok(Vec::new())
        }
        async fn get_file_size(&self, path: &ApiPath) -> ApiResult<u64> {
            Ok(self.objects.lock().unwrap().get(path.as_str()).map(Vec::len).unwrap_or(0) as u64)
        }
        async fn get_total_drive_space(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_used_drive_space(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_total_item_count(&self) -> ApiResult<u64> {
            Ok(self.objects.lock().unwrap().len() as u64)
        }
        async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
            Ok(Vec::new())
        }
        async fn get_file_list(&self, _: Option<String>) -> ApiResult<FileListPage> {
            Ok(FileListPage { entries: Vec::new(), more_data: false, next_marker: None })
        }
        async fn read_file_bytes(
            &self,
            path: &ApiPath,
            len: u64,
            offset: u64,
            buf: &mut [u8],
            _stop: &StopFlag,
        ) -> ApiResult<()> {
            let objects = self.objects.lock().unwrap();
            let data = objects.get(path.as_str()).ok_or(ApiError::ItemNotFound)?;
            let start = offset as usize;
            let end = (start + len as usize).min(data.len());
            buf[..end - start].copy_from_slice(&data[start..end]);
            Ok(())
        }
        async fn upload_file(&self, path: &ApiPath, source_path: &std::path::Path, _stop: &StopFlag) -> ApiResult<()> {
            let bytes = std::fs::read(source_path).map_err(ApiError::from)?;
            self.objects.lock().unwrap().insert(path.as_str().to_string(), bytes);
            Ok(())
        }
        async fn start(&self, _sink: Arc<dyn ReconcileSink>, _stop: &StopFlag) -> ApiResult<bool> {
            Ok(true)
        }
        async fn stop(&self) {}
    }

    async fn make_manager(rename_supported: bool) -> (Arc<FileManager>, Arc<FakeProvider>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let cache_directory = tmp.path().join("cache");
        let metadata = Arc::new(SledMetadataStore::open(&tmp.path().join("meta")).unwrap());
        let file_db = Arc::new(SledFileDb::open(&tmp.path().join("filedb")).unwrap());
        let provider = Arc::new(FakeProvider::new(rename_supported));

        let mut config = Config::default();
        config.cache_directory = cache_directory;
        config.chunk_size = 64;
        config.upload_retry_base_backoff = Duration::ZERO;
        config.upload_retry_max_backoff = Duration::ZERO;
        config.eviction_poll_interval = Duration::from_secs(3600);
        config.chunk_timeout = Duration::ZERO;

        let manager = FileManager::new(provider.clone(), metadata, file_db, EventBus::new(), config);
        manager.start().await.unwrap();
        (manager, provider, tmp)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn write_then_close_uploads_content() {
        let (manager, provider, _tmp) = make_manager(true).await;
        let path = ApiPath::new("/a.bin").unwrap();

        let handle = manager.open(&path, OpenFlags { write: true, create: true, ..Default::default() }).await.unwrap();
        let open_file = manager.get_open_file(&path).await.unwrap();
        open_file.write(handle, 0, b"hello").await.unwrap();
        manager.close(handle).await.unwrap();

        wait_until(|| provider.objects.lock().unwrap().get("/a.bin").map(|v| v.as_slice()) == Some(b"hello".as_slice())).await;
        assert_eq!(provider.objects.lock().unwrap().get("/a.bin").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn remove_file_deletes_cache_copy_and_store_rows() {
        let (manager, provider, _tmp) = make_manager(true).await;
        let path = ApiPath::new("/b.bin").unwrap();

        let handle = manager.open(&path, OpenFlags { write: true, create: true, ..Default::default() }).await.unwrap();
        let open_file = manager.get_open_file(&path).await.unwrap();
        open_file.write(handle, 0, b"bye").await.unwrap();
        manager.close(handle).await.unwrap();
        wait_until(|| provider.objects.lock().unwrap().contains_key("/b.bin")).await;

        manager.remove_file(&path).await.unwrap();
        assert!(!provider.objects.lock().unwrap().contains_key("/b.bin"));
        assert!(manager.get_open_file(&path).await.is_none());
    }

    #[tokio::test]
    async fn remove_file_with_open_handle_defers_delete_until_last_close() {
        let (manager, provider, _tmp) = make_manager(true).await;
        let path = ApiPath::new("/unlinked.bin").unwrap();

        let handle = manager.open(&path, OpenFlags { write: true, create: true, ..Default::default() }).await.unwrap();
        let open_file = manager.get_open_file(&path).await.unwrap();
        open_file.write(handle, 0, b"still here").await.unwrap();
        manager.close(handle).await.unwrap();
        wait_until(|| provider.objects.lock().unwrap().contains_key("/unlinked.bin")).await;

        let handle = manager.open(&path, OpenFlags { read: true, ..Default::default() }).await.unwrap();
        manager.remove_file(&path).await.unwrap();

        // the object is untouched and the still-open handle keeps reading it
        assert!(provider.objects.lock().unwrap().contains_key("/unlinked.bin"));
        let bytes = open_file.read(0, 10).await.unwrap();
        assert_eq!(bytes, b"still here");

        manager.close(handle).await.unwrap();
        wait_until(|| !provider.objects.lock().unwrap().contains_key("/unlinked.bin")).await;
        assert!(manager.get_open_file(&path).await.is_none());
    }

    #[tokio::test]
    async fn rename_over_open_writer_with_native_support_moves_pending_dirty_bytes() {
        let (manager, provider, _tmp) = make_manager(true).await;
        let path = ApiPath::new("/c.bin").unwrap();
        let dest = ApiPath::new("/d.bin").unwrap();

        let handle = manager.open(&path, OpenFlags { write: true, create: true, ..Default::default() }).await.unwrap();
        let open_file = manager.get_open_file(&path).await.unwrap();
        open_file.write(handle, 0, b"pending").await.unwrap();

        manager.rename_file(&path, &dest).await.unwrap();
        assert!(manager.get_open_file(&path).await.is_none());
        assert!(manager.get_open_file(&dest).await.is_some());

        manager.close(handle).await.unwrap();
        wait_until(|| provider.objects.lock().unwrap().get("/d.bin").map(|v| v.as_slice()) == Some(b"pending".as_slice())).await;
        assert!(!provider.objects.lock().unwrap().contains_key("/c.bin"));
    }

    #[tokio::test]
    async fn rename_refuses_while_open_without_native_support() {
        let (manager, _provider, _tmp) = make_manager(false).await;
        let path = ApiPath::new("/c2.bin").unwrap();
        let dest = ApiPath::new("/d2.bin").unwrap();

        let _handle = manager.open(&path, OpenFlags { write: true, create: true, ..Default::default() }).await.unwrap();
        let err = manager.rename_file(&path, &dest).await.unwrap_err();
        assert_eq!(err, ApiError::NotImplemented);
    }

    #[tokio::test]
    async fn rename_without_native_support_falls_back_to_copy_and_delete() {
        let (manager, provider, _tmp) = make_manager(false).await;
        let path = ApiPath::new("/e.bin").unwrap();
        let dest = ApiPath::new("/f.bin").unwrap();

        let handle = manager.open(&path, OpenFlags { write: true, create: true, ..Default::default() }).await.unwrap();
        let open_file = manager.get_open_file(&path).await.unwrap();
        open_file.write(handle, 0, b"data").await.unwrap();
        manager.close(handle).await.unwrap();
        wait_until(|| provider.objects.lock().unwrap().contains_key("/e.bin")).await;

        manager.rename_file(&path, &dest).await.unwrap();
        assert!(!provider.objects.lock().unwrap().contains_key("/e.bin"));
        assert_eq!(provider.objects.lock().unwrap().get("/f.bin").unwrap(), b"data");
    }
}
