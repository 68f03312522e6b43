//! Open File (§4.3): the per-`api_path` object that serves reads and writes,
//! holds at most one dirty source file, drives the Chunk Downloader, and
//! coordinates safe close.
//!
//! One `OpenFile` exists per currently-open path (File Manager invariant
//! §3.1); every handle on that path shares the same `Arc<OpenFile>`. The
//! struct is deliberately the sole owner of the chunk bitset, the size, and
//! the dirty flag -- the File Manager only ever reaches these through the
//! methods below, never by poking fields directly, which is what makes the
//! lock order in spec.md §5 enforceable.

pub mod bitset;
pub mod downloader;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{error, warn};

use crate::accountant::CacheAccountant;
use crate::attributes::AttributeMap;
use crate::error::{ApiError, ApiResult};
use crate::events::{Event, EventBus};
use crate::item::FilesystemItem;
use crate::openfile::bitset::ChunkBitset;
use crate::openfile::downloader::{
    chunks_touched, read_ahead_targets, read_behind_targets, ActiveChunkTable, Registration,
};
use crate::path::ApiPath;
use crate::provider::{Provider, StopFlag};
use crate::store::MetadataStore;

pub type Handle = u64;

/// Platform-agnostic open flags, mirrored from the `O_*` constants the
/// filesystem shim passes in (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub directory: bool,
}

/// What happens to an Open File when its handle count drops to zero
/// (§4.3 "Close semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Other handles remain; nothing else to do.
    StillOpen,
    /// Last handle closed, file was clean: safe to drop immediately.
    ClosableClean,
    /// Last handle closed, file is dirty and the provider can accept
    /// uploads: the caller must enqueue it on the Upload Queue.
    NeedsUpload,
    /// Last handle closed, file is dirty but the provider is direct-only:
    /// the dirty state is discarded (logged as an error by the caller).
    DirtyDiscarded,
    /// Last handle closed on a file `remove_file` marked unlinked while it
    /// was still open: the caller must delete the provider object and the
    /// cache copy instead of uploading.
    Unlinked,
}

fn now_ns() -> u64 {
    crate::attributes::now_ns() as u64
}

/// `(chunk_count, last_chunk_size)` for a file of `size` bytes at a fixed
/// `chunk_size`. `chunk_size` must be non-zero.
fn compute_layout(size: u64, chunk_size: u64) -> (usize, u64) {
    if size == 0 {
        return (0, 0);
    }
    let chunk_count = size.div_ceil(chunk_size) as usize;
    let last_chunk_size = size - (chunk_count as u64 - 1) * chunk_size;
    (chunk_count, last_chunk_size)
}

/// Everything the Chunk Downloader and close sequencing need to mutate
/// together under one lock: size, per-chunk layout, `read_state`, `dirty`.
struct OpenFileIo {
    size: u64,
    chunk_count: usize,
    last_chunk_size: u64,
    read_state: ChunkBitset,
    dirty: bool,
}

/// Parameters fixed for this Open File's lifetime, copied out of [`crate::config::Config`]
/// at construction so later config reloads cannot change behavior mid-handle.
#[derive(Debug, Clone)]
pub struct OpenFileParams {
    pub chunk_size: u64,
    pub read_ahead_count: u32,
    pub read_behind_count: u32,
    pub read_end_count: u32,
    pub chunk_timeout: Duration,
    pub access_time_tracking: bool,
}

/// A resumable snapshot of download progress, persisted by the File Manager
/// when an incomplete file is closed (§4.4 "Resume").
#[derive(Debug, Clone)]
pub struct ResumeSnapshot {
    pub api_path: ApiPath,
    pub source_path: PathBuf,
    pub chunk_size: u64,
    pub last_chunk_size: u64,
    pub read_state: Vec<bool>,
}

pub struct OpenFile {
    api_path: std::sync::RwLock<ApiPath>,
    directory: bool,
    provider: Arc<dyn Provider>,
    metadata: Arc<dyn MetadataStore>,
    events: EventBus,
    accountant: Arc<CacheAccountant>,
    params: OpenFileParams,
    source_path: tokio::sync::RwLock<PathBuf>,
    io: tokio::sync::RwLock<OpenFileIo>,
    handles: tokio::sync::Mutex<HashMap<Handle, OpenFlags>>,
    active_chunks: ActiveChunkTable,
    stop: StopFlag,
    unlinked: AtomicBool,
    ever_opened: AtomicBool,
    last_activity_ns: AtomicU64,
}

impl OpenFile {
    /// Construct a fresh Open File, or one re-hydrated from a resume entry
    /// (`read_state` non-empty) on startup.
    pub fn new(
        item: &FilesystemItem,
        source_path: PathBuf,
        provider: Arc<dyn Provider>,
        metadata: Arc<dyn MetadataStore>,
        events: EventBus,
        accountant: Arc<CacheAccountant>,
        params: OpenFileParams,
        read_state: Option<ChunkBitset>,
    ) -> Self {
        let chunk_size = params.chunk_size.max(1);
        let (chunk_count, last_chunk_size) = compute_layout(item.size, chunk_size);
        let read_state = read_state.unwrap_or_else(|| ChunkBitset::new(chunk_count));
        Self {
            api_path: std::sync::RwLock::new(item.api_path.clone()),
            directory: item.directory,
            provider,
            metadata,
            events,
            accountant,
            params,
            source_path: tokio::sync::RwLock::new(source_path),
            io: tokio::sync::RwLock::new(OpenFileIo {
                size: item.size,
                chunk_count,
                last_chunk_size,
                read_state,
                dirty: false,
            }),
            handles: tokio::sync::Mutex::new(HashMap::new()),
            active_chunks: ActiveChunkTable::default(),
            stop: StopFlag::new(),
            unlinked: AtomicBool::new(false),
            ever_opened: AtomicBool::new(false),
            last_activity_ns: AtomicU64::new(now_ns()),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.params.chunk_size.max(1)
    }

    /// The path this Open File currently serves. Read under a plain
    /// `std::sync::RwLock` since the value is only ever swapped by
    /// `set_api_path`, never mutated in place, and the read side must stay
    /// cheap -- it's touched on every event publish and provider call.
    pub fn api_path(&self) -> ApiPath {
        self.api_path.read().expect("api_path lock poisoned").clone()
    }

    /// Re-point this Open File at a new logical path. Called by the File
    /// Manager after a successful provider-level rename of a still-open file
    /// (spec.md §4.7 / S4): the source file and all in-flight chunk state are
    /// untouched, only the identity used for subsequent events, metadata
    /// writes, and provider calls changes.
    pub fn set_api_path(&self, new_path: ApiPath) {
        *self.api_path.write().expect("api_path lock poisoned") = new_path;
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::Release);
    }

    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    fn touch_activity(&self) {
        self.last_activity_ns.store(now_ns(), Ordering::Release);
    }

    pub async fn handle_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn get_source_path(&self) -> PathBuf {
        self.source_path.read().await.clone()
    }

    pub async fn set_source_path(&self, path: PathBuf) {
        *self.source_path.write().await = path;
    }

    pub async fn get_file_size(&self) -> u64 {
        self.io.read().await.size
    }

    pub async fn is_modified(&self) -> bool {
        self.io.read().await.dirty
    }

    pub async fn is_complete(&self) -> bool {
        self.io.read().await.read_state.all()
    }

    pub async fn get_read_state(&self) -> Vec<bool> {
        self.io.read().await.read_state.to_bools()
    }

    pub fn is_write_supported(&self) -> bool {
        !self.provider.is_read_only() && !self.provider.is_direct_only()
    }

    pub async fn can_close(&self) -> bool {
        self.handle_count().await == 0 && (!self.is_modified().await)
    }

    pub async fn resume_snapshot(&self) -> ResumeSnapshot {
        let io = self.io.read().await;
        ResumeSnapshot {
            api_path: self.api_path(),
            source_path: self.source_path.read().await.clone(),
            chunk_size: self.chunk_size(),
            last_chunk_size: io.last_chunk_size,
            read_state: io.read_state.to_bools(),
        }
    }

    // -- handle lifecycle --------------------------------------------------

    /// Register a new handle. On the very first handle ever registered,
    /// kicks off the `read_end` prefetch and the idle-timeout watcher.
    pub async fn add(self: &Arc<Self>, handle: Handle, flags: OpenFlags) {
        self.handles.lock().await.insert(handle, flags);
        self.touch_activity();
        if !self.ever_opened.swap(true, Ordering::AcqRel) {
            self.events.publish(Event::FilesystemItemOpened { api_path: self.api_path().to_string() });
            self.spawn_read_end_prefetch();
            self.spawn_idle_timeout_watcher();
        }
        self.events.publish(Event::FilesystemItemHandleOpened {
            api_path: self.api_path().to_string(),
            handle,
        });
    }

    /// Unregister `handle`. See [`CloseOutcome`] for what the caller must do
    /// next.
    pub async fn remove(&self, handle: Handle) -> CloseOutcome {
        {
            let mut handles = self.handles.lock().await;
            handles.remove(&handle);
        }
        self.events.publish(Event::FilesystemItemHandleClosed {
            api_path: self.api_path().to_string(),
            handle,
        });
        if self.handle_count().await > 0 {
            return CloseOutcome::StillOpen;
        }
        self.events.publish(Event::FilesystemItemClosed { api_path: self.api_path().to_string() });
        // `remove_file` on a still-open path defers the provider delete to
        // this moment (spec.md §4.7) rather than discarding any pending
        // dirty bytes into an upload that would just recreate the object.
        if self.is_unlinked() {
            return CloseOutcome::Unlinked;
        }
        if !self.is_modified().await {
            return CloseOutcome::ClosableClean;
        }
        if self.provider.is_direct_only() {
            error!(api_path = %self.api_path(), "discarding dirty direct-only file on close");
            return CloseOutcome::DirtyDiscarded;
        }
        CloseOutcome::NeedsUpload
    }

    // -- reads ---------------------------------------------------------------

    pub async fn read(self: &Arc<Self>, offset: u64, len: u64) -> ApiResult<Vec<u8>> {
        let size = self.io.read().await.size;
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let effective_len = len.min(size - offset);
        let chunk_size = self.chunk_size();
        let range = chunks_touched(offset, effective_len, chunk_size);
        let last_touched = *range.end();
        for chunk in range {
            self.ensure_chunk(chunk).await?;
        }

        let path = self.source_path.read().await.clone();
        let mut file = tokio::fs::File::open(&path).await.map_err(ApiError::from)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(ApiError::from)?;
        let mut buf = vec![0u8; effective_len as usize];
        file.read_exact(&mut buf).await.map_err(ApiError::from)?;

        self.touch_activity();
        self.spawn_prefetch(last_touched);

        if self.params.access_time_tracking {
            let mut meta = AttributeMap::new();
            meta.touch_accessed();
            let _ = self.metadata.set_item_meta(&self.api_path(), &meta).await;
        }

        Ok(buf)
    }

    /// Fetch chunk `chunk` if missing, deduplicating concurrent callers.
    async fn ensure_chunk(self: &Arc<Self>, chunk: usize) -> ApiResult<()> {
        if self.io.read().await.read_state.get(chunk) {
            return Ok(());
        }
        if self.stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }
        match self.active_chunks.register(chunk).await {
            Registration::WaitFor(entry) => ActiveChunkTable::wait(&entry).await,
            Registration::FetchIt(entry) => {
                let result = self.fetch_chunk(chunk).await;
                self.active_chunks.complete(chunk, &entry, result.clone()).await;
                result
            }
        }
    }

    async fn fetch_chunk(&self, chunk: usize) -> ApiResult<()> {
        let chunk_size = self.chunk_size();
        let (chunk_count, last_chunk_size) = {
            let io = self.io.read().await;
            (io.chunk_count, io.last_chunk_size)
        };
        let len = if chunk + 1 == chunk_count { last_chunk_size } else { chunk_size };
        if len == 0 {
            return Ok(());
        }
        let offset = chunk as u64 * chunk_size;

        self.events.publish(Event::DownloadBegin {
            api_path: self.api_path().to_string(),
            chunk: chunk as u64,
        });

        let mut buf = vec![0u8; len as usize];
        let fetch = self.provider.read_file_bytes(&self.api_path(), len, offset, &mut buf, &self.stop).await;
        if let Err(err) = fetch {
            warn!(?err, api_path = %self.api_path(), chunk, "chunk download failed");
            return Err(err);
        }

        let path = self.source_path.read().await.clone();
        if let Err(err) = write_chunk_to_disk(&path, offset, &buf).await {
            error!(%err, api_path = %self.api_path(), chunk, "failed to persist downloaded chunk");
            return Err(ApiError::from(err));
        }

        {
            let mut io = self.io.write().await;
            io.read_state.set(chunk);
        }
        self.touch_activity();
        self.events.publish(Event::DownloadProgress {
            api_path: self.api_path().to_string(),
            chunk: chunk as u64,
            total_chunks: chunk_count as u64,
        });
        self.events.publish(Event::DownloadEnd {
            api_path: self.api_path().to_string(),
            chunk: chunk as u64,
        });
        Ok(())
    }

    fn spawn_prefetch(self: &Arc<Self>, around: usize) {
        if self.stop.is_stopped() {
            return;
        }
        let this = self.clone();
        let read_ahead_count = self.params.read_ahead_count;
        let read_behind_count = self.params.read_behind_count;
        tokio::spawn(async move {
            let chunk_count = this.io.read().await.chunk_count;
            let ahead = read_ahead_targets(around, read_ahead_count, chunk_count);
            let behind = read_behind_targets(around, read_behind_count);
            for idx in ahead.into_iter().chain(behind) {
                if this.stop.is_stopped() {
                    return;
                }
                let _ = this.ensure_chunk(idx).await;
            }
        });
    }

    fn spawn_read_end_prefetch(self: &Arc<Self>) {
        if self.params.read_end_count == 0 {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let chunk_count = this.io.read().await.chunk_count;
            if chunk_count <= this.params.read_ahead_count as usize {
                return;
            }
            let start = chunk_count.saturating_sub(this.params.read_end_count as usize);
            for idx in start..chunk_count {
                if this.stop.is_stopped() {
                    return;
                }
                let _ = this.ensure_chunk(idx).await;
            }
        });
    }

    /// Background watcher: if no handle is open and no chunk has completed
    /// within `chunk_timeout`, raise `item_timeout` and stop further
    /// downloads (§4.4 "Timeout"). Holds only a `Weak` reference so it never
    /// keeps an otherwise-dead Open File alive.
    fn spawn_idle_timeout_watcher(self: &Arc<Self>) {
        if self.params.chunk_timeout.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let timeout_ns = self.params.chunk_timeout.as_nanos() as u64;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(this) = weak.upgrade() else { return };
                if this.stop.is_stopped() || this.is_complete().await {
                    return;
                }
                if this.handle_count().await > 0 {
                    this.touch_activity();
                    continue;
                }
                let elapsed = now_ns().saturating_sub(this.last_activity_ns.load(Ordering::Acquire));
                if elapsed >= timeout_ns {
                    this.stop.stop();
                    this.events.publish(Event::ItemTimeout { api_path: this.api_path().to_string() });
                    return;
                }
            }
        });
    }

    // -- writes ----------------------------------------------------------

    pub async fn write(self: &Arc<Self>, handle: Handle, offset: u64, bytes: &[u8]) -> ApiResult<u64> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let (write_ok, append) = {
            let handles = self.handles.lock().await;
            match handles.get(&handle) {
                Some(flags) if flags.write => (true, flags.append),
                Some(_) => (false, false),
                None => return Err(ApiError::InvalidHandle),
            }
        };
        if !write_ok {
            return Err(ApiError::AccessDenied);
        }
        if !self.is_write_supported() {
            return Err(ApiError::PermissionDenied);
        }

        // A chunk this write only partially overwrites must be materialized
        // from the provider first, or the "mark touched chunks present" step
        // below would make the untouched remainder of that chunk read back
        // as zeros instead of the provider's bytes (spec.md §3(3)). Done
        // before taking the exclusive `io` lock since `ensure_chunk` takes
        // its own lock on `io` internally.
        {
            let chunk_size = self.chunk_size();
            let pre_size = self.io.read().await.size;
            let pre_offset = if append { pre_size } else { offset };
            let pre_new_end = pre_offset + bytes.len() as u64;
            for chunk in chunks_touched(pre_offset, bytes.len() as u64, chunk_size) {
                let chunk_start = chunk as u64 * chunk_size;
                if chunk_start >= pre_size {
                    continue;
                }
                let chunk_end_in_old_file = (chunk_start + chunk_size).min(pre_size);
                let fully_overwritten = pre_offset <= chunk_start && pre_new_end >= chunk_end_in_old_file;
                if !fully_overwritten {
                    self.ensure_chunk(chunk).await?;
                }
            }
        }

        let path = self.source_path.read().await.clone();
        let mut io = self.io.write().await;
        let effective_offset = if append { io.size } else { offset };
        let old_size = io.size;
        let new_end = effective_offset + bytes.len() as u64;

        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await.map_err(ApiError::from)?;
        if new_end > old_size {
            file.set_len(new_end).await.map_err(ApiError::from)?;
            self.accountant.update(old_size, new_end, false);
            io.size = new_end;
            let (chunk_count, last_chunk_size) = compute_layout(new_end, self.chunk_size());
            io.read_state.resize(chunk_count);
            // the zero-filled tail beyond `old_size` is authoritative content;
            // mark every chunk from old_size's chunk onward present.
            let boundary = (old_size / self.chunk_size()) as usize;
            io.read_state.set_range(boundary, chunk_count);
            io.chunk_count = chunk_count;
            io.last_chunk_size = last_chunk_size;
        }
        file.seek(SeekFrom::Start(effective_offset)).await.map_err(ApiError::from)?;
        file.write_all(bytes).await.map_err(ApiError::from)?;
        file.flush().await.map_err(ApiError::from)?;

        let chunk_size = self.chunk_size();
        for chunk in chunks_touched(effective_offset, bytes.len() as u64, chunk_size) {
            io.read_state.set(chunk);
        }
        io.dirty = true;
        let size_now = io.size;
        drop(io);

        self.touch_activity();
        let mut meta = AttributeMap::new();
        meta.set_size(size_now);
        meta.touch_modified_written_changed();
        let _ = self.metadata.set_item_meta(&self.api_path(), &meta).await;

        Ok(bytes.len() as u64)
    }

    pub async fn resize(&self, new_size: u64) -> ApiResult<()> {
        if !self.is_write_supported() {
            return Err(ApiError::PermissionDenied);
        }
        let path = self.source_path.read().await.clone();
        let mut io = self.io.write().await;
        let old_size = io.size;

        let file = tokio::fs::OpenOptions::new().write(true).open(&path).await.map_err(ApiError::from)?;
        file.set_len(new_size).await.map_err(ApiError::from)?;
        self.accountant.update(old_size, new_size, false);

        let (chunk_count, last_chunk_size) = compute_layout(new_size, self.chunk_size());
        io.read_state.resize(chunk_count);
        if new_size > old_size {
            let boundary = (old_size / self.chunk_size()) as usize;
            io.read_state.set_range(boundary, chunk_count);
        }
        io.size = new_size;
        io.chunk_count = chunk_count;
        io.last_chunk_size = last_chunk_size;
        io.dirty = true;
        drop(io);

        self.touch_activity();
        let mut meta = AttributeMap::new();
        meta.set_size(new_size);
        meta.touch_modified_written_changed();
        let _ = self.metadata.set_item_meta(&self.api_path(), &meta).await;
        Ok(())
    }

    /// Run `f` with exclusive access to the underlying file descriptor
    /// (`fallocate`, `fsync`, and similar platform calls land here). If
    /// `new_size` differs from the tracked size, re-runs size bookkeeping
    /// afterward.
    pub async fn native_operation<F, R>(&self, new_size: Option<u64>, f: F) -> ApiResult<R>
    where
        F: FnOnce(&std::fs::File) -> std::io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let path = self.source_path.read().await.clone();
        let result = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
            f(&file)
        })
        .await
        .map_err(|_| ApiError::Error)?
        .map_err(ApiError::from)?;

        if let Some(size) = new_size {
            let current = self.io.read().await.size;
            if current != size {
                self.resize(size).await?;
            }
        }
        Ok(result)
    }
}

async fn write_chunk_to_disk(path: &Path, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(buf).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::CacheAccountant;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeProvider {
        data: std::sync::Mutex<HashMap<String, Vec<u8>>>,
        read_calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn check_version(&self) -> ApiResult<(u32, u32)> {
            Ok((1, 1))
        }
        async fn create_directory(&self, _: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            Ok(())
        }
        async fn create_file(&self, _: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            Ok(())
        }
        async fn remove_directory(&self, _: &ApiPath) -> ApiResult<()> {
            Ok(())
        }
        async fn remove_file(&self, _: &ApiPath) -> ApiResult<()> {
            Ok(())
        }
        async fn is_directory(&self, _: &ApiPath) -> ApiResult<bool> {
            Ok(false)
        }
        async fn is_file(&self, _: &ApiPath) -> ApiResult<bool> {
            Ok(true)
        }
        async fn get_item_meta(&self, _: &ApiPath) -> ApiResult<AttributeMap> {
            Ok(AttributeMap::new())
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
        async fn get_directory_items(&self, _: &ApiPath) -> ApiResult<Vec<crate::provider::DirectoryItem>> {
            Ok(Vec::new())
        }
        async fn get_file_size(&self, path: &ApiPath) -> ApiResult<u64> {
            Ok(self.data.lock().unwrap().get(path.as_str()).map(Vec::len).unwrap_or(0) as u64)
        }
        async fn get_total_drive_space(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_used_drive_space(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_total_item_count(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
            Ok(Vec::new())
        }
        async fn get_file_list(&self, _: Option<String>) -> ApiResult<crate::provider::FileListPage> {
            Ok(crate::provider::FileListPage { entries: Vec::new(), more_data: false, next_marker: None })
        }
        async fn read_file_bytes(
            &self,
            path: &ApiPath,
            len: u64,
            offset: u64,
            buf: &mut [u8],
            _stop: &StopFlag,
        ) -> ApiResult<()> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            let data = self.data.lock().unwrap();
            let full = data.get(path.as_str()).ok_or(ApiError::ItemNotFound)?;
            let start = offset as usize;
            let end = (start + len as usize).min(full.len());
            buf[..end - start].copy_from_slice(&full[start..end]);
            Ok(())
        }
        async fn upload_file(&self, _: &ApiPath, _: &Path, _: &StopFlag) -> ApiResult<()> {
            Ok(())
        }
        async fn start(&self, _sink: Arc<dyn crate::provider::ReconcileSink>, _stop: &StopFlag) -> ApiResult<bool> {
            Ok(true)
        }
        async fn stop(&self) {}
    }

    struct NoopMetadataStore;

    #[async_trait]
    impl MetadataStore for NoopMetadataStore {
        async fn clear(&self) -> ApiResult<()> {
            Ok(())
        }
        async fn upsert_item(&self, _: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            Ok(())
        }
        async fn remove_item(&self, _: &ApiPath) -> ApiResult<()> {
            Ok(())
        }
        async fn get_item_meta(&self, _: &ApiPath) -> ApiResult<AttributeMap> {
            Ok(AttributeMap::new())
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
        async fn get_api_path_by_source_path(&self, _: &str) -> ApiResult<Option<ApiPath>> {
            Ok(None)
        }
        async fn rename_item_meta(&self, _: &ApiPath, _: &ApiPath) -> ApiResult<()> {
            Ok(())
        }
        async fn enumerate_api_paths(
            &self,
            _: &mut (dyn FnMut(ApiPath) + Send),
            _: &StopFlag,
        ) -> ApiResult<()> {
            Ok(())
        }
        async fn get_total_item_count(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_total_size(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
            Ok(Vec::new())
        }
    }

    fn test_params() -> OpenFileParams {
        OpenFileParams {
            chunk_size: 4,
            read_ahead_count: 0,
            read_behind_count: 0,
            read_end_count: 0,
            chunk_timeout: Duration::ZERO,
            access_time_tracking: false,
        }
    }

    async fn make_open_file(
        data: Vec<u8>,
        source_path: PathBuf,
        chunk_size: u64,
    ) -> (Arc<OpenFile>, Arc<FakeProvider>) {
        let api_path = ApiPath::new("/a.bin").unwrap();
        tokio::fs::write(&source_path, vec![0u8; data.len()]).await.unwrap();
        let mut store = HashMap::new();
        store.insert(api_path.as_str().to_string(), data.clone());
        let provider = Arc::new(FakeProvider { data: std::sync::Mutex::new(store), read_calls: AtomicU32::new(0) });
        let mut item = FilesystemItem::new_file(api_path);
        item.size = data.len() as u64;
        let mut params = test_params();
        params.chunk_size = chunk_size;
        let accountant = Arc::new(CacheAccountant::new(0));
        accountant.update(0, data.len() as u64, false);
        let of = Arc::new(OpenFile::new(
            &item,
            source_path,
            provider.clone(),
            Arc::new(NoopMetadataStore),
            EventBus::new(),
            accountant,
            params,
            None,
        ));
        (of, provider)
    }

    #[tokio::test]
    async fn cold_read_downloads_then_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (of, provider) = make_open_file(b"123456789".to_vec(), dir.path().join("src"), 4).await;

        let bytes = of.read(0, 9).await.unwrap();
        assert_eq!(bytes, b"123456789");
        assert!(of.is_complete().await);
        let calls_after_first = provider.read_calls.load(Ordering::SeqCst);
        assert!(calls_after_first > 0);

        let bytes_again = of.read(0, 9).await.unwrap();
        assert_eq!(bytes_again, b"123456789");
        assert_eq!(provider.read_calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn read_past_eof_returns_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let (of, _provider) = make_open_file(b"abc".to_vec(), dir.path().join("src"), 4).await;
        let bytes = of.read(3, 1).await.unwrap();
        assert!(bytes.is_empty());
        let bytes = of.read(10, 5).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn write_without_write_handle_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let (of, _provider) = make_open_file(b"abc".to_vec(), dir.path().join("src"), 4).await;
        of.add(1, OpenFlags { read: true, ..Default::default() }).await;
        let err = of.write(1, 0, b"x").await.unwrap_err();
        assert_eq!(err, ApiError::AccessDenied);
    }

    #[tokio::test]
    async fn write_past_eof_zero_fills_the_gap() {
        let dir = tempfile::tempdir().unwrap();
        let (of, _provider) = make_open_file(Vec::new(), dir.path().join("src"), 4).await;
        of.add(1, OpenFlags { write: true, ..Default::default() }).await;
        of.write(1, 10, b"hi").await.unwrap();

        assert_eq!(of.get_file_size().await, 12);
        assert!(of.is_modified().await);
        let bytes = of.read(0, 12).await.unwrap();
        assert_eq!(&bytes[0..10], &[0u8; 10]);
        assert_eq!(&bytes[10..12], b"hi");
    }

    #[tokio::test]
    async fn close_of_last_dirty_handle_requests_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (of, _provider) = make_open_file(Vec::new(), dir.path().join("src"), 4).await;
        of.add(7, OpenFlags { write: true, ..Default::default() }).await;
        of.write(7, 0, b"hello").await.unwrap();
        let outcome = of.remove(7).await;
        assert_eq!(outcome, CloseOutcome::NeedsUpload);
    }

    #[tokio::test]
    async fn close_of_last_clean_handle_is_closable() {
        let dir = tempfile::tempdir().unwrap();
        let (of, _provider) = make_open_file(b"abc".to_vec(), dir.path().join("src"), 4).await;
        of.add(9, OpenFlags { read: true, ..Default::default() }).await;
        let outcome = of.remove(9).await;
        assert_eq!(outcome, CloseOutcome::ClosableClean);
    }

    #[tokio::test]
    async fn resize_down_truncates_read_state_consistently() {
        let dir = tempfile::tempdir().unwrap();
        let (of, _provider) = make_open_file(b"123456789".to_vec(), dir.path().join("src"), 4).await;
        of.read(0, 9).await.unwrap();
        assert!(of.is_complete().await);

        of.resize(4).await.unwrap();
        assert_eq!(of.get_file_size().await, 4);
        assert!(of.is_complete().await);
    }
}
