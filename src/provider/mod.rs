//! The single trait every backend variant implements, plus the shared
//! reconcile-on-start helper the base (non-passthrough) variants use.

pub mod encrypted_passthrough;
pub mod object_store;
pub mod remote_mount;
pub mod renterd;
pub mod reconcile;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::attributes::AttributeMap;
use crate::error::{ApiError, ApiResult};
use crate::path::ApiPath;

/// Cooperative cancellation flag threaded through every provider I/O call and
/// every Chunk Downloader / Upload Queue wait.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// One entry returned by [`Provider::get_directory_items`].
#[derive(Debug, Clone)]
pub struct DirectoryItem {
    pub api_path: ApiPath,
    pub directory: bool,
    pub size: u64,
    pub meta: AttributeMap,
}

/// One entry returned by [`Provider::get_file_list`]'s paginated enumeration.
#[derive(Debug, Clone)]
pub struct ApiFile {
    pub api_path: ApiPath,
    pub directory: bool,
    pub size: u64,
}

/// The result of [`Provider::get_file_list`]: a page of entries plus whether
/// another page remains.
pub struct FileListPage {
    pub entries: Vec<ApiFile>,
    pub more_data: bool,
    pub next_marker: Option<String>,
}

/// Callback surface a provider's `start()` reconciliation drives. Implemented
/// by the File Manager; kept as its own trait so provider variants do not
/// depend on the manager type.
#[async_trait]
pub trait ReconcileSink: Send + Sync {
    /// Called once per item discovered during a full enumeration.
    async fn on_item_discovered(&self, file: ApiFile);
    /// Called once enumeration is complete, before orphan-source-file sweep.
    async fn on_reconcile_complete(&self);
    /// Cache directory to sweep for orphan source files after reconciliation.
    fn cache_directory(&self) -> std::path::PathBuf;
    /// Every source path currently referenced by a known item, so the sweep
    /// can tell "orphan" from "just not uploaded yet".
    async fn known_source_paths(&self) -> std::collections::HashSet<std::path::PathBuf>;
}

/// The uniform backend contract. All methods return [`ApiError`] values;
/// providers that are read-only or direct-only reject the relevant subset
/// with `PermissionDenied`/`NotSupported`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// `true` for a provider that never accepts writes/creates/removes/renames.
    fn is_read_only(&self) -> bool {
        false
    }

    /// `true` for a provider that cannot back a writeable handle (no whole-file
    /// upload capability); see glossary "direct-only provider".
    fn is_direct_only(&self) -> bool {
        false
    }

    /// `true` if this provider can perform a native rename (otherwise the File
    /// Manager falls back to copy+delete when there are no open handles).
    fn supports_rename(&self) -> bool {
        true
    }

    async fn check_version(&self) -> ApiResult<(u32, u32)>;

    async fn create_directory(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()>;
    async fn create_file(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()>;
    async fn create_directory_clone_source_meta(
        &self,
        src: &ApiPath,
        dst: &ApiPath,
    ) -> ApiResult<()> {
        let meta = self.get_item_meta(src).await?;
        self.create_directory(dst, &meta).await
    }

    async fn remove_directory(&self, path: &ApiPath) -> ApiResult<()>;
    async fn remove_file(&self, path: &ApiPath) -> ApiResult<()>;

    /// Optional. Providers that cannot rename return `NotImplemented`.
    async fn rename_file(&self, _src: &ApiPath, _dst: &ApiPath) -> ApiResult<()> {
        Err(ApiError::NotImplemented)
    }

    async fn is_directory(&self, path: &ApiPath) -> ApiResult<bool>;
    async fn is_file(&self, path: &ApiPath) -> ApiResult<bool>;
    async fn is_file_writeable(&self, path: &ApiPath) -> ApiResult<bool> {
        if self.is_read_only() {
            return Ok(false);
        }
        self.is_file(path).await
    }

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap>;
    async fn set_item_meta_one(&self, path: &ApiPath, key: &str, value: &str) -> ApiResult<()>;
    async fn set_item_meta(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()>;
    async fn remove_item_meta(&self, path: &ApiPath, key: &str) -> ApiResult<()>;

    /// List one level. Directories MUST precede files (the rename-directory
    /// algorithm relies on this ordering).
    async fn get_directory_items(&self, path: &ApiPath) -> ApiResult<Vec<DirectoryItem>>;
    async fn get_directory_item_count(&self, path: &ApiPath) -> ApiResult<u64> {
        Ok(self.get_directory_items(path).await?.len() as u64)
    }

    async fn get_file_size(&self, path: &ApiPath) -> ApiResult<u64>;
    async fn get_total_drive_space(&self) -> ApiResult<u64>;
    async fn get_used_drive_space(&self) -> ApiResult<u64>;
    async fn get_total_item_count(&self) -> ApiResult<u64>;
    async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>>;

    /// Paginated full enumeration; callers loop while `more_data` is set.
    async fn get_file_list(&self, marker: Option<String>) -> ApiResult<FileListPage>;

    /// Ranged GET. Implementations retry internally up to their configured
    /// `retry_read_count` with exponential backoff, honoring `stop`.
    async fn read_file_bytes(
        &self,
        path: &ApiPath,
        len: u64,
        offset: u64,
        buf: &mut [u8],
        stop: &StopFlag,
    ) -> ApiResult<()>;

    /// Whole-file PUT from `source_path`. Honors `stop`.
    async fn upload_file(&self, path: &ApiPath, source_path: &Path, stop: &StopFlag)
        -> ApiResult<()>;

    /// Bring the provider online. Returns `Ok(true)` once accepting operations,
    /// `Ok(false)` if startup was cancelled via `stop`, or an error.
    async fn start(
        &self,
        sink: Arc<dyn ReconcileSink>,
        stop: &StopFlag,
    ) -> ApiResult<bool>;

    async fn stop(&self);
}
