//! Sia `renterd` provider variant. Talks to a renterd worker's REST API
//! (`/api/worker/objects/{path}` for object GET/PUT/DELETE, `/api/bus/objects`
//! for enumeration) rather than an S3 bucket; otherwise structurally close to
//! the object-store variant since both are REST, paginated, whole-object-PUT
//! backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache as MokaCache;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::attributes::AttributeMap;
use crate::error::{ApiError, ApiResult};
use crate::path::ApiPath;
use crate::provider::reconcile::reconcile_on_start;
use crate::provider::{ApiFile, DirectoryItem, FileListPage, Provider, ReconcileSink, StopFlag};

#[derive(Debug, Clone)]
pub struct RenterdConfig {
    pub bucket: String,
    pub base_url: String,
    pub worker_password: String,
    pub max_concurrent_requests: usize,
    pub directory_listing_cache_ttl: Duration,
    pub retry_read_count: u32,
}

pub struct RenterdProvider {
    client: reqwest::Client,
    cfg: RenterdConfig,
    request_limiter: Arc<Semaphore>,
    dir_cache: MokaCache<ApiPath, Arc<Vec<DirectoryItem>>>,
    stopped: Mutex<bool>,
}

#[derive(Deserialize)]
struct RenterdObjectMeta {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct RenterdListEntry {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    is_dir: bool,
}

#[derive(Deserialize)]
struct RenterdListResponse {
    #[serde(default)]
    objects: Vec<RenterdListEntry>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    marker: Option<String>,
}

impl RenterdProvider {
    pub fn new(cfg: RenterdConfig) -> Self {
        let dir_cache = MokaCache::builder()
            .time_to_live(cfg.directory_listing_cache_ttl)
            .max_capacity(10_000)
            .build();
        Self {
            client: reqwest::Client::new(),
            request_limiter: Arc::new(Semaphore::new(cfg.max_concurrent_requests.max(1))),
            dir_cache,
            cfg,
            stopped: Mutex::new(false),
        }
    }

    fn worker_url(&self, path: &str) -> String {
        format!(
            "{}/api/worker/objects/{}?bucket={}",
            self.cfg.base_url.trim_end_matches('/'),
            path.trim_start_matches('/'),
            self.cfg.bucket
        )
    }

    fn bus_list_url(&self, prefix: &str, marker: Option<&str>) -> String {
        let mut url = format!(
            "{}/api/bus/objects/{}?bucket={}",
            self.cfg.base_url.trim_end_matches('/'),
            prefix.trim_start_matches('/'),
            self.cfg.bucket
        );
        if let Some(marker) = marker {
            url.push_str(&format!("&marker={marker}"));
        }
        url
    }

    async fn permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.request_limiter.acquire().await.expect("semaphore not closed")
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth("", Some(&self.cfg.worker_password))
    }

    fn map_status(status: StatusCode) -> ApiError {
        match status {
            StatusCode::NOT_FOUND => ApiError::ItemNotFound,
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => ApiError::PermissionDenied,
            StatusCode::CONFLICT => ApiError::ItemExists,
            s if s.is_server_error() => ApiError::CommError,
            _ => ApiError::Error,
        }
    }

    fn map_transport_err(err: reqwest::Error) -> ApiError {
        if err.is_timeout() || err.is_connect() {
            ApiError::CommError
        } else {
            ApiError::Error
        }
    }

    fn invalidate_parent(&self, path: &ApiPath) {
        if let Some(parent) = path.parent() {
            self.dir_cache.invalidate(&parent);
        }
    }
}

#[async_trait]
impl Provider for RenterdProvider {
    fn supports_rename(&self) -> bool {
        false
    }

    async fn check_version(&self) -> ApiResult<(u32, u32)> {
        let _permit = self.permit().await;
        let url = format!("{}/api/bus/consensus/state", self.cfg.base_url.trim_end_matches('/'));
        let resp = self.authed(self.client.get(&url)).send().await.map_err(Self::map_transport_err)?;
        if resp.status().is_success() {
            Ok((1, 1))
        } else {
            Err(Self::map_status(resp.status()))
        }
    }

    async fn create_directory(&self, path: &ApiPath, _meta: &AttributeMap) -> ApiResult<()> {
        // renterd has no directory objects; a directory exists purely as a
        // namespace prefix under which files can be created. Nothing to persist.
        self.invalidate_parent(path);
        Ok(())
    }

    async fn create_file(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let _permit = self.permit().await;
        let url = self.worker_url(path.as_str());
        let mut req = self.authed(self.client.put(&url)).body(Vec::<u8>::new());
        if let Some(source) = meta.source() {
            req = req.header("x-repertory-source", source.to_string());
        }
        let resp = req.send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        self.invalidate_parent(path);
        Ok(())
    }

    async fn remove_directory(&self, path: &ApiPath) -> ApiResult<()> {
        // Deleting every object whose key starts with this prefix is the File
        // Manager's job (it walks its own metadata store); the provider only
        // needs to forget the cached listing.
        self.invalidate_parent(path);
        Ok(())
    }

    async fn remove_file(&self, path: &ApiPath) -> ApiResult<()> {
        let _permit = self.permit().await;
        let url = self.worker_url(path.as_str());
        let resp = self.authed(self.client.delete(&url)).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::map_status(resp.status()));
        }
        self.invalidate_parent(path);
        Ok(())
    }

    async fn is_directory(&self, path: &ApiPath) -> ApiResult<bool> {
        if path.is_root() {
            return Ok(true);
        }
        Ok(!self.get_directory_items(path).await?.is_empty())
    }

    async fn is_file(&self, path: &ApiPath) -> ApiResult<bool> {
        Ok(self.get_item_meta(path).await.is_ok())
    }

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap> {
        let _permit = self.permit().await;
        let url = format!(
            "{}/api/bus/objects/{}?bucket={}",
            self.cfg.base_url.trim_end_matches('/'),
            path.as_str().trim_start_matches('/'),
            self.cfg.bucket
        );
        let resp = self.authed(self.client.get(&url)).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let meta: RenterdObjectMeta = resp.json().await.map_err(Self::map_transport_err)?;
        let mut attrs = AttributeMap::new();
        attrs.set_size(meta.size);
        if let Some(mime) = meta.mime_type {
            attrs.set("content-type", mime);
        }
        Ok(attrs)
    }

    async fn set_item_meta_one(&self, path: &ApiPath, key: &str, value: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(path).await.unwrap_or_default();
        meta.set(key, value);
        self.set_item_meta(path, &meta).await
    }

    async fn set_item_meta(&self, _path: &ApiPath, _meta: &AttributeMap) -> ApiResult<()> {
        // renterd object metadata is fixed at upload time; repertory-core's
        // Metadata Store is authoritative for mutable attributes here.
        Ok(())
    }

    async fn remove_item_meta(&self, _path: &ApiPath, _key: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn get_directory_items(&self, path: &ApiPath) -> ApiResult<Vec<DirectoryItem>> {
        if let Some(cached) = self.dir_cache.get(path) {
            return Ok((*cached).clone());
        }

        let _permit = self.permit().await;
        let prefix = if path.is_root() { String::new() } else { format!("{}/", path.as_str()) };
        let url = self.bus_list_url(&prefix, None);
        let resp = self.authed(self.client.get(&url)).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let parsed: RenterdListResponse = resp.json().await.map_err(Self::map_transport_err)?;
        let mut items: Vec<DirectoryItem> = parsed
            .objects
            .into_iter()
            .map(|entry| DirectoryItem {
                api_path: path.join(entry.name.trim_end_matches('/')),
                directory: entry.is_dir,
                size: entry.size,
                meta: AttributeMap::new(),
            })
            .collect();
        items.sort_by_key(|item| !item.directory);

        self.dir_cache.insert(path.clone(), Arc::new(items.clone()));
        Ok(items)
    }

    async fn get_file_size(&self, path: &ApiPath) -> ApiResult<u64> {
        Ok(self.get_item_meta(path).await?.size())
    }

    async fn get_total_drive_space(&self) -> ApiResult<u64> {
        let _permit = self.permit().await;
        let url = format!("{}/api/bus/autopilots", self.cfg.base_url.trim_end_matches('/'));
        match self.authed(self.client.get(&url)).send().await {
            Ok(resp) if resp.status().is_success() => Ok(u64::MAX),
            _ => Ok(u64::MAX),
        }
    }

    async fn get_used_drive_space(&self) -> ApiResult<u64> {
        self.get_total_item_count().await
    }

    async fn get_total_item_count(&self) -> ApiResult<u64> {
        let mut count = 0u64;
        let mut marker = None;
        loop {
            let page = self.get_file_list(marker).await?;
            count += page.entries.len() as u64;
            if !page.more_data {
                break;
            }
            marker = page.next_marker;
        }
        Ok(count)
    }

    async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
        Ok(Vec::new())
    }

    async fn get_file_list(&self, marker: Option<String>) -> ApiResult<FileListPage> {
        let _permit = self.permit().await;
        let url = self.bus_list_url("", marker.as_deref());
        let resp = self.authed(self.client.get(&url)).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let parsed: RenterdListResponse = resp.json().await.map_err(Self::map_transport_err)?;
        let entries = parsed
            .objects
            .into_iter()
            .filter_map(|entry| {
                let api_path = ApiPath::new(&format!("/{}", entry.name.trim_start_matches('/')))?;
                Some(ApiFile { api_path, directory: entry.is_dir, size: entry.size })
            })
            .collect();
        Ok(FileListPage { entries, more_data: parsed.has_more, next_marker: parsed.marker })
    }

    async fn read_file_bytes(
        &self,
        path: &ApiPath,
        len: u64,
        offset: u64,
        buf: &mut [u8],
        stop: &StopFlag,
    ) -> ApiResult<()> {
        let url = self.worker_url(path.as_str());
        let range = format!("bytes={}-{}", offset, offset + len.saturating_sub(1));

        let mut attempt = 0u32;
        loop {
            if stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }
            attempt += 1;
            let _permit = self.permit().await;
            let req = self.authed(self.client.get(&url)).header(reqwest::header::RANGE, &range);
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(Self::map_transport_err)?;
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    return Ok(());
                }
                Ok(resp) => {
                    let err = Self::map_status(resp.status());
                    if !err.is_retryable() || attempt >= self.cfg.retry_read_count {
                        return Err(ApiError::DownloadFailed);
                    }
                }
                Err(err) => {
                    let mapped = Self::map_transport_err(err);
                    if !mapped.is_retryable() || attempt >= self.cfg.retry_read_count {
                        return Err(ApiError::DownloadFailed);
                    }
                }
            }
            let backoff = Duration::from_millis(100 * 2u64.saturating_pow(attempt.min(10)));
            debug!(?backoff, attempt, "retrying read_file_bytes");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn upload_file(&self, path: &ApiPath, source_path: &Path, stop: &StopFlag) -> ApiResult<()> {
        if stop.is_stopped() {
            return Err(ApiError::UploadStopped);
        }
        let body = tokio::fs::read(source_path).await.map_err(ApiError::from)?;
        let url = self.worker_url(path.as_str());
        let _permit = self.permit().await;
        let resp = self.authed(self.client.put(&url)).body(body).send().await.map_err(|err| {
            let mapped = Self::map_transport_err(err);
            if mapped == ApiError::CommError {
                ApiError::UploadFailed
            } else {
                mapped
            }
        })?;
        if !resp.status().is_success() {
            return Err(ApiError::UploadFailed);
        }
        self.invalidate_parent(path);
        Ok(())
    }

    async fn start(&self, sink: Arc<dyn ReconcileSink>, stop: &StopFlag) -> ApiResult<bool> {
        let (required, observed) = self.check_version().await?;
        if observed < required {
            return Err(ApiError::IncompatibleVersion);
        }
        *self.stopped.lock().await = false;

        let this = self;
        let list_page = move |marker: Option<String>| {
            let fut = this.get_file_list(marker);
            Box::pin(async move { fut.await })
                as std::pin::Pin<
                    Box<dyn std::future::Future<Output = ApiResult<FileListPage>> + Send>,
                >
        };
        reconcile_on_start(list_page, sink, stop).await?;
        Ok(!stop.is_stopped())
    }

    async fn stop(&self) {
        *self.stopped.lock().await = true;
    }
}
