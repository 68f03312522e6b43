//! Encrypted-passthrough provider variant: a read-only view that encrypts a
//! local directory's file and directory *names* on the fly. Content is
//! served unmodified -- this variant exists so a remote-mount peer (or a
//! local mount used purely as an encrypted name-obfuscation layer) never
//! observes real on-disk names, only the opaque token produced by
//! [`crate::crypto::FilenameCipher`].
//!
//! Being read-only, this variant never populates the Upload Queue and never
//! backs a writeable handle; every mutating call returns `PermissionDenied`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::attributes::AttributeMap;
use crate::crypto::FilenameCipher;
use crate::error::{ApiError, ApiResult};
use crate::path::ApiPath;
use crate::provider::{ApiFile, DirectoryItem, FileListPage, Provider, ReconcileSink, StopFlag};

pub struct EncryptedPassthroughProvider {
    source_directory: PathBuf,
    cipher: FilenameCipher,
}

impl EncryptedPassthroughProvider {
    pub fn new(source_directory: PathBuf, secret: &[u8]) -> Self {
        Self { source_directory, cipher: FilenameCipher::from_secret(secret) }
    }

    /// Map a logical (encrypted-segment) api_path back to the real path
    /// under `source_directory` by decrypting each segment in turn.
    fn real_path(&self, path: &ApiPath) -> ApiResult<PathBuf> {
        if path.is_root() {
            return Ok(self.source_directory.clone());
        }
        let mut real = self.source_directory.clone();
        for segment in path.as_str().trim_start_matches('/').split('/') {
            let plain = self.cipher.decrypt_name(segment).ok_or(ApiError::ItemNotFound)?;
            real.push(plain);
        }
        Ok(real)
    }

    fn encrypted_child(&self, parent: &ApiPath, real_name: &str) -> ApiPath {
        parent.join(&self.cipher.encrypt_name(real_name))
    }

    async fn meta_for(&self, real_path: &Path) -> ApiResult<AttributeMap> {
        let fs_meta = tokio::fs::metadata(real_path).await.map_err(ApiError::from)?;
        let mut meta = AttributeMap::new();
        meta.set_size(if fs_meta.is_dir() { 0 } else { fs_meta.len() });
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            meta.set_mode(fs_meta.permissions().mode());
        }
        Ok(meta)
    }

    /// Recursively walk `source_directory`, reporting every entry to `sink`
    /// under its encrypted api_path. Local directories are entirely the
    /// provider's own namespace, so there is no remote reconciliation step
    /// here -- just a one-time local discovery pass.
    async fn discover(&self, sink: &Arc<dyn ReconcileSink>, stop: &StopFlag) -> ApiResult<()> {
        let mut stack = vec![(ApiPath::new("/").unwrap(), self.source_directory.clone())];
        while let Some((api_parent, real_dir)) = stack.pop() {
            if stop.is_stopped() {
                return Ok(());
            }
            let mut entries = match tokio::fs::read_dir(&real_dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(%err, dir = %real_dir.display(), "failed to read passthrough directory");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                let api_path = self.encrypted_child(&api_parent, &name);
                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(_) => continue,
                };
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                sink.on_item_discovered(ApiFile {
                    api_path: api_path.clone(),
                    directory: file_type.is_dir(),
                    size,
                })
                .await;
                if file_type.is_dir() {
                    stack.push((api_path, entry.path()));
                }
            }
        }
        sink.on_reconcile_complete().await;
        Ok(())
    }
}

#[async_trait]
impl Provider for EncryptedPassthroughProvider {
    fn is_read_only(&self) -> bool {
        true
    }

    fn supports_rename(&self) -> bool {
        false
    }

    async fn check_version(&self) -> ApiResult<(u32, u32)> {
        Ok((1, 1))
    }

    async fn create_directory(&self, _path: &ApiPath, _meta: &AttributeMap) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn create_file(&self, _path: &ApiPath, _meta: &AttributeMap) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn remove_directory(&self, _path: &ApiPath) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn remove_file(&self, _path: &ApiPath) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn is_directory(&self, path: &ApiPath) -> ApiResult<bool> {
        let real = self.real_path(path)?;
        Ok(tokio::fs::metadata(&real).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn is_file(&self, path: &ApiPath) -> ApiResult<bool> {
        let real = self.real_path(path)?;
        Ok(tokio::fs::metadata(&real).await.map(|m| m.is_file()).unwrap_or(false))
    }

    async fn is_file_writeable(&self, _path: &ApiPath) -> ApiResult<bool> {
        Ok(false)
    }

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap> {
        let real = self.real_path(path)?;
        self.meta_for(&real).await
    }

    async fn set_item_meta_one(&self, _path: &ApiPath, _key: &str, _value: &str) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn set_item_meta(&self, _path: &ApiPath, _meta: &AttributeMap) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn remove_item_meta(&self, _path: &ApiPath, _key: &str) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn get_directory_items(&self, path: &ApiPath) -> ApiResult<Vec<DirectoryItem>> {
        let real = self.real_path(path)?;
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&real).await.map_err(ApiError::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(ApiError::from)? {
            let name = entry.file_name().to_string_lossy().to_string();
            let api_path = self.encrypted_child(path, &name);
            let fs_meta = entry.metadata().await.map_err(ApiError::from)?;
            let item = DirectoryItem {
                api_path,
                directory: fs_meta.is_dir(),
                size: fs_meta.len(),
                meta: self.meta_for(&entry.path()).await?,
            };
            if item.directory {
                dirs.push(item);
            } else {
                files.push(item);
            }
        }
        dirs.extend(files);
        Ok(dirs)
    }

    async fn get_file_size(&self, path: &ApiPath) -> ApiResult<u64> {
        let real = self.real_path(path)?;
        tokio::fs::metadata(&real).await.map(|m| m.len()).map_err(ApiError::from)
    }

    async fn get_total_drive_space(&self) -> ApiResult<u64> {
        self.get_used_drive_space().await
    }

    async fn get_used_drive_space(&self) -> ApiResult<u64> {
        async fn walk(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0u64;
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    total += Box::pin(walk(&entry.path())).await?;
                } else {
                    total += meta.len();
                }
            }
            Ok(total)
        }
        walk(&self.source_directory).await.map_err(ApiError::from)
    }

    async fn get_total_item_count(&self) -> ApiResult<u64> {
        async fn walk(dir: &Path) -> std::io::Result<u64> {
            let mut total = 0u64;
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                total += 1;
                if entry.file_type().await?.is_dir() {
                    total += Box::pin(walk(&entry.path())).await?;
                }
            }
            Ok(total)
        }
        walk(&self.source_directory).await.map_err(ApiError::from)
    }

    async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
        Ok(Vec::new())
    }

    async fn get_file_list(&self, _marker: Option<String>) -> ApiResult<FileListPage> {
        let collector = Arc::new(CollectingSink::default());
        self.discover(&(collector.clone() as Arc<dyn ReconcileSink>), &StopFlag::new()).await?;
        let entries = collector.take().await;
        Ok(FileListPage { entries, more_data: false, next_marker: None })
    }

    async fn read_file_bytes(
        &self,
        path: &ApiPath,
        len: u64,
        offset: u64,
        buf: &mut [u8],
        stop: &StopFlag,
    ) -> ApiResult<()> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        if stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }
        let real = self.real_path(path)?;
        let mut file = tokio::fs::File::open(&real).await.map_err(ApiError::from)?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(ApiError::from)?;
        file.read_exact(&mut buf[..len as usize]).await.map_err(ApiError::from)?;
        Ok(())
    }

    async fn upload_file(&self, _path: &ApiPath, _source_path: &Path, _stop: &StopFlag) -> ApiResult<()> {
        Err(ApiError::PermissionDenied)
    }

    async fn start(&self, sink: Arc<dyn ReconcileSink>, stop: &StopFlag) -> ApiResult<bool> {
        if !self.source_directory.is_dir() {
            return Err(ApiError::DirectoryNotFound);
        }
        self.discover(&sink, stop).await?;
        Ok(!stop.is_stopped())
    }

    async fn stop(&self) {}
}

/// Collects discovered entries in memory; used to implement
/// [`Provider::get_file_list`] in terms of [`EncryptedPassthroughProvider::discover`]
/// without a real paginated backend.
#[derive(Clone, Default)]
struct CollectingSink {
    entries: Arc<tokio::sync::Mutex<Vec<ApiFile>>>,
}

impl CollectingSink {
    async fn take(&self) -> Vec<ApiFile> {
        std::mem::take(&mut *self.entries.lock().await)
    }
}

#[async_trait]
impl ReconcileSink for CollectingSink {
    async fn on_item_discovered(&self, file: ApiFile) {
        self.entries.lock().await.push(file);
    }
    async fn on_reconcile_complete(&self) {}
    fn cache_directory(&self) -> PathBuf {
        PathBuf::new()
    }
    async fn known_source_paths(&self) -> std::collections::HashSet<PathBuf> {
        std::collections::HashSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_names_and_serves_content() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("report.pdf"), b"hello").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let provider = EncryptedPassthroughProvider::new(dir.path().to_path_buf(), b"secret");
        let items = provider.get_directory_items(&ApiPath::new("/").unwrap()).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].directory, "directories must sort before files");

        let file_item = items.iter().find(|i| !i.directory).unwrap();
        assert_eq!(file_item.size, 5);

        let mut buf = vec![0u8; 5];
        provider
            .read_file_bytes(&file_item.api_path, 5, 0, &mut buf, &StopFlag::new())
            .await
            .unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn mutations_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = EncryptedPassthroughProvider::new(dir.path().to_path_buf(), b"secret");
        let err = provider
            .create_file(&ApiPath::new("/x").unwrap(), &AttributeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::PermissionDenied);
    }
}
