//! Shared fixture for the end-to-end tests: an in-memory `Provider` plus a
//! `FileManager` wired to real sled-backed stores under a temp directory,
//! mirroring the scenarios in spec.md §8.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use repertory_core::attributes::AttributeMap;
use repertory_core::config::Config;
use repertory_core::error::{ApiError, ApiResult};
use repertory_core::events::EventBus;
use repertory_core::file_manager::FileManager;
use repertory_core::path::ApiPath;
use repertory_core::provider::reconcile::reconcile_on_start;
use repertory_core::provider::{
    DirectoryItem, FileListPage, Provider, ReconcileSink, StopFlag,
};
use repertory_core::store::file_db::SledFileDb;
use repertory_core::store::metadata_store::SledMetadataStore;

/// An in-memory stand-in for an S3-compatible bucket: a map from api_path to
/// bytes, guarded by a plain mutex since every call here is already routed
/// through `spawn_blocking`-free async methods.
pub struct InMemoryProvider {
    pub objects: StdMutex<HashMap<String, Vec<u8>>>,
    rename_supported: bool,
    pub read_calls: std::sync::atomic::AtomicU32,
}

impl InMemoryProvider {
    pub fn new(rename_supported: bool) -> Self {
        Self { objects: StdMutex::new(HashMap::new()), rename_supported, read_calls: std::sync::atomic::AtomicU32::new(0) }
    }

    pub fn seed(&self, path: &str, data: &[u8]) {
        self.objects.lock().unwrap().insert(path.to_string(), data.to_vec());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
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
        let entries = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(path, data)| {
                ApiPath::new(path).map(|api_path| repertory_core::provider::ApiFile {
                    api_path,
                    directory: false,
                    size: data.len() as u64,
                })
            })
            .collect();
        Ok(FileListPage { entries, more_data: false, next_marker: None })
    }
    async fn read_file_bytes(
        &self,
        path: &ApiPath,
        len: u64,
        offset: u64,
        buf: &mut [u8],
        _stop: &StopFlag,
    ) -> ApiResult<()> {
        self.read_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        let data = objects.get(path.as_str()).ok_or(ApiError::ItemNotFound)?;
        let start = offset as usize;
        let end = (start + len as usize).min(data.len());
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(())
    }
    async fn upload_file(&self, path: &ApiPath, source_path: &Path, _stop: &StopFlag) -> ApiResult<()> {
        let bytes = std::fs::read(source_path).map_err(ApiError::from)?;
        self.objects.lock().unwrap().insert(path.as_str().to_string(), bytes);
        Ok(())
    }
    async fn start(&self, sink: Arc<dyn ReconcileSink>, stop: &StopFlag) -> ApiResult<bool> {
        let this = self;
        let list_page = move |marker: Option<String>| {
            let fut = this.get_file_list(marker);
            Box::pin(async move { fut.await })
                as std::pin::Pin<Box<dyn std::future::Future<Output = ApiResult<FileListPage>> + Send>>
        };
        reconcile_on_start(list_page, sink, stop).await?;
        Ok(!stop.is_stopped())
    }
    async fn stop(&self) {}
}

/// A running `FileManager` plus the temp directory and provider backing it,
/// kept alive for the duration of the test.
pub struct Fixture {
    pub manager: Arc<FileManager>,
    pub provider: Arc<InMemoryProvider>,
    pub metadata: Arc<SledMetadataStore>,
    pub cache_directory: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

impl Fixture {
    pub async fn new(rename_supported: bool) -> Self {
        Self::with_config(rename_supported, |_| {}).await
    }

    /// Like [`Self::new`], but `configure` runs after the baseline test
    /// config is built so a test can dial in e.g. a short eviction poll
    /// interval without repeating the whole setup.
    pub async fn with_config(rename_supported: bool, configure: impl FnOnce(&mut Config)) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let cache_directory = tmp.path().join("cache");
        let metadata = Arc::new(SledMetadataStore::open(&tmp.path().join("meta")).unwrap());
        let file_db = Arc::new(SledFileDb::open(&tmp.path().join("filedb")).unwrap());
        let provider = Arc::new(InMemoryProvider::new(rename_supported));

        let mut config = Config::default();
        config.cache_directory = cache_directory.clone();
        config.chunk_size = 4;
        config.read_ahead_count = 0;
        config.read_behind_count = 0;
        config.read_end_count = 0;
        config.upload_retry_base_backoff = Duration::ZERO;
        config.upload_retry_max_backoff = Duration::ZERO;
        config.eviction_poll_interval = Duration::from_secs(3600);
        config.eviction_high_watermark = 0.0;
        config.chunk_timeout = Duration::ZERO;
        configure(&mut config);

        let manager = FileManager::new(provider.clone(), metadata.clone(), file_db, EventBus::new(), config);
        manager.start().await.unwrap();
        Self { manager, provider, metadata, cache_directory, _tmp: tmp }
    }

    /// Total bytes of regular files directly inside the cache directory,
    /// mirroring what the Cache-Space Accountant tracks.
    pub fn cache_bytes_on_disk(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(dir) = std::fs::read_dir(&self.cache_directory) {
            for entry in dir.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        total += meta.len();
                    }
                }
            }
        }
        total
    }

    pub async fn wait_until<F: Fn() -> bool>(&self, condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn path(raw: &str) -> ApiPath {
    ApiPath::new(raw).unwrap()
}
