//! S3-compatible object-store provider variant: `GET`/`PUT`/`DELETE` on
//! `{bucket}/{key}`, `GET ?list-type=2&prefix=` for enumeration. Directories
//! are zero-byte keys ending in `/`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache as MokaCache;
use reqwest::StatusCode;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::attributes::AttributeMap;
use crate::error::{ApiError, ApiResult};
use crate::path::ApiPath;
use crate::provider::reconcile::reconcile_on_start;
use crate::provider::{ApiFile, DirectoryItem, FileListPage, Provider, ReconcileSink, StopFlag};

const USER_META_PREFIX: &str = "x-amz-meta-";

/// Connection parameters for one S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub max_concurrent_requests: usize,
    pub directory_listing_cache_ttl: Duration,
    pub retry_read_count: u32,
}

pub struct ObjectStoreProvider {
    client: reqwest::Client,
    cfg: ObjectStoreConfig,
    /// Bounds concurrent in-flight requests.
    request_limiter: Arc<Semaphore>,
    /// Short-TTL one-level listing cache, invalidated on any mutating call
    /// that touches the directory.
    dir_cache: MokaCache<ApiPath, Arc<Vec<DirectoryItem>>>,
    stopped: Mutex<bool>,
}

impl ObjectStoreProvider {
    pub fn new(cfg: ObjectStoreConfig) -> Self {
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

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.cfg.endpoint.trim_end_matches('/'), self.cfg.bucket, key.trim_start_matches('/'))
    }

    /// S3 keys for a directory always end in `/`.
    fn directory_key(path: &ApiPath) -> String {
        if path.is_root() {
            String::new()
        } else {
            format!("{}/", path.as_str().trim_start_matches('/'))
        }
    }

    fn file_key(path: &ApiPath) -> String {
        path.as_str().trim_start_matches('/').to_string()
    }

    async fn permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        self.request_limiter.acquire().await.expect("semaphore not closed")
    }

    fn map_status(status: StatusCode) -> ApiError {
        match status {
            StatusCode::NOT_FOUND => ApiError::ItemNotFound,
            StatusCode::FORBIDDEN => ApiError::AccessDenied,
            StatusCode::UNAUTHORIZED => ApiError::PermissionDenied,
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

    fn meta_to_headers(meta: &AttributeMap) -> HashMap<String, String> {
        meta.iter()
            .map(|(k, v)| (format!("{USER_META_PREFIX}{k}"), v.to_string()))
            .collect()
    }

    fn headers_to_meta(headers: &reqwest::header::HeaderMap) -> AttributeMap {
        let mut meta = AttributeMap::new();
        for (name, value) in headers.iter() {
            if let Some(key) = name.as_str().strip_prefix(USER_META_PREFIX) {
                if let Ok(value) = value.to_str() {
                    meta.set(key, value);
                }
            }
        }
        meta
    }

    fn invalidate_parent(&self, path: &ApiPath) {
        if let Some(parent) = path.parent() {
            self.dir_cache.invalidate(&parent);
        }
    }
}

#[async_trait]
impl Provider for ObjectStoreProvider {
    async fn check_version(&self) -> ApiResult<(u32, u32)> {
        let _permit = self.permit().await;
        let url = format!("{}/{}", self.cfg.endpoint.trim_end_matches('/'), self.cfg.bucket);
        match self.client.head(&url).send().await {
            Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND => {
                Ok((1, 1))
            }
            Ok(resp) => Err(Self::map_status(resp.status())),
            Err(err) => Err(Self::map_transport_err(err)),
        }
    }

    async fn create_directory(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let _permit = self.permit().await;
        let url = self.object_url(&Self::directory_key(path));
        let mut req = self.client.put(&url).body(Vec::<u8>::new());
        for (k, v) in Self::meta_to_headers(meta) {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        self.invalidate_parent(path);
        Ok(())
    }

    async fn create_file(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let _permit = self.permit().await;
        let url = self.object_url(&Self::file_key(path));
        let mut req = self.client.put(&url).body(Vec::<u8>::new());
        for (k, v) in Self::meta_to_headers(meta) {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        self.invalidate_parent(path);
        Ok(())
    }

    async fn remove_directory(&self, path: &ApiPath) -> ApiResult<()> {
        let _permit = self.permit().await;
        let url = self.object_url(&Self::directory_key(path));
        let resp = self.client.delete(&url).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::map_status(resp.status()));
        }
        self.invalidate_parent(path);
        Ok(())
    }

    async fn remove_file(&self, path: &ApiPath) -> ApiResult<()> {
        let _permit = self.permit().await;
        let url = self.object_url(&Self::file_key(path));
        let resp = self.client.delete(&url).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(Self::map_status(resp.status()));
        }
        self.invalidate_parent(path);
        Ok(())
    }

    // S3 has no native rename; the File Manager falls back to copy+delete.
    // `rename_file` keeps the trait's default `NotImplemented`.

    async fn is_directory(&self, path: &ApiPath) -> ApiResult<bool> {
        if path.is_root() {
            return Ok(true);
        }
        match self.get_item_meta(path).await {
            Ok(_) => Ok(path.as_str().ends_with('/')),
            Err(ApiError::ItemNotFound) => {
                let key = Self::directory_key(path);
                let _permit = self.permit().await;
                let url = self.object_url(&key);
                let resp = self.client.head(&url).send().await.map_err(Self::map_transport_err)?;
                Ok(resp.status().is_success())
            }
            Err(err) => Err(err),
        }
    }

    async fn is_file(&self, path: &ApiPath) -> ApiResult<bool> {
        let _permit = self.permit().await;
        let url = self.object_url(&Self::file_key(path));
        let resp = self.client.head(&url).send().await.map_err(Self::map_transport_err)?;
        Ok(resp.status().is_success())
    }

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap> {
        let _permit = self.permit().await;
        let url = self.object_url(&Self::file_key(path));
        let resp = self.client.head(&url).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        Ok(Self::headers_to_meta(resp.headers()))
    }

    async fn set_item_meta_one(&self, path: &ApiPath, key: &str, value: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(path).await.unwrap_or_default();
        meta.set(key, value);
        self.set_item_meta(path, &meta).await
    }

    async fn set_item_meta(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        // S3 user-metadata is immutable post-upload without a full copy;
        // re-PUT a zero-length body with updated headers onto the same key
        // (acceptable because this path is only reached for already-empty
        // placeholder objects -- directories and freshly created files).
        let _permit = self.permit().await;
        let url = self.object_url(&Self::file_key(path));
        let mut req = self.client.put(&url).body(Vec::<u8>::new());
        for (k, v) in Self::meta_to_headers(meta) {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        Ok(())
    }

    async fn remove_item_meta(&self, path: &ApiPath, key: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(path).await?;
        meta.remove(key);
        self.set_item_meta(path, &meta).await
    }

    async fn get_directory_items(&self, path: &ApiPath) -> ApiResult<Vec<DirectoryItem>> {
        if let Some(cached) = self.dir_cache.get(path) {
            return Ok((*cached).clone());
        }

        let _permit = self.permit().await;
        let prefix = Self::directory_key(path);
        let url = format!(
            "{}/{}?list-type=2&delimiter=/&prefix={}",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.bucket,
            prefix
        );
        let resp = self.client.get(&url).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let body = resp.text().await.map_err(Self::map_transport_err)?;
        let mut items = parse_list_bucket_result(&body, path);

        // Directories before files, matching Provider::get_directory_items' contract.
        items.sort_by_key(|item| !item.directory);

        self.dir_cache.insert(path.clone(), Arc::new(items.clone()));
        Ok(items)
    }

    async fn get_file_size(&self, path: &ApiPath) -> ApiResult<u64> {
        Ok(self.get_item_meta(path).await?.size())
    }

    async fn get_total_drive_space(&self) -> ApiResult<u64> {
        // Object stores do not expose a capacity concept; report an effectively
        // unbounded quota so callers treat this provider as never "full".
        Ok(u64::MAX)
    }

    async fn get_used_drive_space(&self) -> ApiResult<u64> {
        Ok(self.get_total_item_count().await.unwrap_or(0))
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
        // No provider-side concept of pinning; the Metadata Store (owned by the
        // File Manager) is authoritative, so this always reports empty.
        Ok(Vec::new())
    }

    async fn get_file_list(&self, marker: Option<String>) -> ApiResult<FileListPage> {
        let _permit = self.permit().await;
        let mut url = format!(
            "{}/{}?list-type=2",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.bucket
        );
        if let Some(marker) = &marker {
            url.push_str(&format!("&continuation-token={marker}"));
        }
        let resp = self.client.get(&url).send().await.map_err(Self::map_transport_err)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let body = resp.text().await.map_err(Self::map_transport_err)?;
        let (entries, next_marker) = parse_list_bucket_result_flat(&body);
        let more_data = next_marker.is_some();
        Ok(FileListPage { entries, more_data, next_marker })
    }

    async fn read_file_bytes(
        &self,
        path: &ApiPath,
        len: u64,
        offset: u64,
        buf: &mut [u8],
        stop: &StopFlag,
    ) -> ApiResult<()> {
        let url = self.object_url(&Self::file_key(path));
        let range = format!("bytes={}-{}", offset, offset + len.saturating_sub(1));

        let mut attempt = 0u32;
        loop {
            if stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }
            attempt += 1;
            let _permit = self.permit().await;
            let result = self
                .client
                .get(&url)
                .header(reqwest::header::RANGE, &range)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await.map_err(Self::map_transport_err)?;
                    if bytes.len() < buf.len() {
                        warn!(
                            expected = buf.len(),
                            got = bytes.len(),
                            %path,
                            "short range response from object store"
                        );
                        if attempt >= self.cfg.retry_read_count {
                            return Err(ApiError::DownloadFailed);
                        }
                        let backoff = Duration::from_millis(100 * 2u64.saturating_pow(attempt.min(10)));
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    buf.copy_from_slice(&bytes[..buf.len()]);
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

    async fn upload_file(
        &self,
        path: &ApiPath,
        source_path: &Path,
        stop: &StopFlag,
    ) -> ApiResult<()> {
        if stop.is_stopped() {
            return Err(ApiError::UploadStopped);
        }
        let body = tokio::fs::read(source_path).await.map_err(ApiError::from)?;
        let url = self.object_url(&Self::file_key(path));
        let _permit = self.permit().await;
        let resp = self.client.put(&url).body(body).send().await.map_err(|err| {
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

/// Parse a minimal subset of an S3 `ListObjectsV2` XML response into one-level
/// directory items (`CommonPrefixes` -> directories, `Contents` -> files).
fn parse_list_bucket_result(body: &str, parent: &ApiPath) -> Vec<DirectoryItem> {
    let mut items = Vec::new();
    for prefix in extract_tag_values(body, "Prefix") {
        if let Some(name) = prefix.trim_end_matches('/').rsplit('/').next() {
            if name.is_empty() {
                continue;
            }
            items.push(DirectoryItem {
                api_path: parent.join(name),
                directory: true,
                size: 0,
                meta: AttributeMap::new(),
            });
        }
    }
    for (key, size) in extract_contents(body) {
        if key.ends_with('/') {
            continue;
        }
        if let Some(name) = key.rsplit('/').next() {
            items.push(DirectoryItem {
                api_path: parent.join(name),
                directory: false,
                size,
                meta: AttributeMap::new(),
            });
        }
    }
    items
}

fn parse_list_bucket_result_flat(body: &str) -> (Vec<ApiFile>, Option<String>) {
    let entries = extract_contents(body)
        .into_iter()
        .filter_map(|(key, size)| {
            let path = ApiPath::new(&format!("/{key}"))?;
            Some(ApiFile { api_path: path, directory: key.ends_with('/'), size })
        })
        .collect();
    let next_marker = extract_tag_values(body, "NextContinuationToken").into_iter().next();
    (entries, next_marker)
}

fn extract_tag_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        if let Some(end) = after.find(&close) {
            out.push(after[..end].to_string());
            rest = &after[end + close.len()..];
        } else {
            break;
        }
    }
    out
}

fn extract_contents(body: &str) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<Contents>") {
        let after = &rest[start + "<Contents>".len()..];
        let end = after.find("</Contents>").unwrap_or(after.len());
        let block = &after[..end];
        let key = extract_tag_values(block, "Key").into_iter().next();
        let size = extract_tag_values(block, "Size")
            .into_iter()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        if let Some(key) = key {
            out.push((key, size));
        }
        rest = &after[end..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_key_adds_trailing_slash() {
        let path = ApiPath::new("/a/b").unwrap();
        assert_eq!(ObjectStoreProvider::directory_key(&path), "a/b/");
        assert_eq!(ObjectStoreProvider::directory_key(&ApiPath::new("/").unwrap()), "");
    }

    #[test]
    fn parses_list_bucket_contents_and_prefixes() {
        let body = r#"
            <ListBucketResult>
              <CommonPrefixes><Prefix>dir1/</Prefix></CommonPrefixes>
              <Contents><Key>dir1/file.txt</Key><Size>42</Size></Contents>
              <Contents><Key>top.txt</Key><Size>7</Size></Contents>
            </ListBucketResult>"#;
        let root = ApiPath::new("/").unwrap();
        let items = parse_list_bucket_result(body, &root);
        assert!(items.iter().any(|i| i.directory && i.api_path.as_str() == "/dir1"));
        assert!(items.iter().any(|i| !i.directory && i.api_path.as_str() == "/top.txt" && i.size == 7));
    }
}
