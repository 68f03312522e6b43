//! Remote-mount provider variant: forwards every call across an RPC link to
//! a peer process that is itself running one of the other variants.
//!
//! The wire protocol -- framing, connection setup, reconnection policy -- is
//! out of scope; what belongs here is the shape of the request/response
//! contract a transport has to support to stand in for a local [`Provider`].
//! [`RemoteMountTransport`] is that seam. Anything that can answer a
//! [`RemoteRequest`] with the matching [`RemoteResponse`] variant -- a TCP
//! link, a Unix socket, an in-process loopback used for testing -- can back
//! this provider.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::attributes::AttributeMap;
use crate::error::{ApiError, ApiResult};
use crate::path::ApiPath;
use crate::provider::{ApiFile, DirectoryItem, FileListPage, Provider, ReconcileSink, StopFlag};

/// One request shape the remote-mount provider can issue. Mirrors
/// [`Provider`]'s method set; read operations that return a bool/u64 share a
/// response variant since their payload shape is identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteRequest {
    CheckVersion,
    CreateDirectory { path: String, meta: AttributeMap },
    CreateFile { path: String, meta: AttributeMap },
    RemoveDirectory { path: String },
    RemoveFile { path: String },
    RenameFile { src: String, dst: String },
    IsDirectory { path: String },
    IsFile { path: String },
    GetItemMeta { path: String },
    SetItemMetaOne { path: String, key: String, value: String },
    SetItemMeta { path: String, meta: AttributeMap },
    RemoveItemMeta { path: String, key: String },
    GetDirectoryItems { path: String },
    GetFileSize { path: String },
    GetTotalDriveSpace,
    GetUsedDriveSpace,
    GetTotalItemCount,
    GetPinnedFiles,
    GetFileList { marker: Option<String> },
    ReadFileBytes { path: String, len: u64, offset: u64 },
    UploadFile { path: String, source_path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteResponse {
    Version(u32, u32),
    Unit,
    Bool(bool),
    U64(u64),
    Meta(AttributeMap),
    DirectoryItems(Vec<RemoteDirectoryItem>),
    Paths(Vec<String>),
    FileList { entries: Vec<RemoteApiFile>, more_data: bool, next_marker: Option<String> },
    Bytes(Vec<u8>),
    Error(RemoteError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDirectoryItem {
    pub api_path: String,
    pub directory: bool,
    pub size: u64,
    pub meta: AttributeMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteApiFile {
    pub api_path: String,
    pub directory: bool,
    pub size: u64,
}

/// Wire-safe mirror of [`ApiError`]; the transport never ships the enum
/// itself since a future peer version might add variants this one predates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum RemoteError {
    NotImplemented,
    ItemNotFound,
    DirectoryNotFound,
    DirectoryNotEmpty,
    FileExists,
    PermissionDenied,
    AccessDenied,
    CommError,
    DownloadStopped,
    DownloadTimeout,
    UploadFailed,
    Other,
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotImplemented => ApiError::NotImplemented,
            RemoteError::ItemNotFound => ApiError::ItemNotFound,
            RemoteError::DirectoryNotFound => ApiError::DirectoryNotFound,
            RemoteError::DirectoryNotEmpty => ApiError::DirectoryNotEmpty,
            RemoteError::FileExists => ApiError::FileExists,
            RemoteError::PermissionDenied => ApiError::PermissionDenied,
            RemoteError::AccessDenied => ApiError::AccessDenied,
            RemoteError::CommError => ApiError::CommError,
            RemoteError::DownloadStopped => ApiError::DownloadStopped,
            RemoteError::DownloadTimeout => ApiError::DownloadTimeout,
            RemoteError::UploadFailed => ApiError::UploadFailed,
            RemoteError::Other => ApiError::Error,
        }
    }
}

/// The transport seam. A real implementation owns a socket and a framing
/// codec; none of that belongs to this provider variant.
#[async_trait]
pub trait RemoteMountTransport: Send + Sync {
    async fn call(&self, request: RemoteRequest) -> ApiResult<RemoteResponse>;
}

pub struct RemoteMountProvider {
    transport: Arc<dyn RemoteMountTransport>,
    read_only: bool,
}

impl RemoteMountProvider {
    pub fn new(transport: Arc<dyn RemoteMountTransport>, read_only: bool) -> Self {
        Self { transport, read_only }
    }

    async fn call(&self, request: RemoteRequest) -> ApiResult<RemoteResponse> {
        match self.transport.call(request).await? {
            RemoteResponse::Error(err) => Err(err.into()),
            other => Ok(other),
        }
    }

    fn expect_unit(response: RemoteResponse) -> ApiResult<()> {
        match response {
            RemoteResponse::Unit => Ok(()),
            _ => Err(ApiError::CommError),
        }
    }

    fn expect_bool(response: RemoteResponse) -> ApiResult<bool> {
        match response {
            RemoteResponse::Bool(b) => Ok(b),
            _ => Err(ApiError::CommError),
        }
    }

    fn expect_u64(response: RemoteResponse) -> ApiResult<u64> {
        match response {
            RemoteResponse::U64(n) => Ok(n),
            _ => Err(ApiError::CommError),
        }
    }

    fn expect_meta(response: RemoteResponse) -> ApiResult<AttributeMap> {
        match response {
            RemoteResponse::Meta(meta) => Ok(meta),
            _ => Err(ApiError::CommError),
        }
    }
}

#[async_trait]
impl Provider for RemoteMountProvider {
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn supports_rename(&self) -> bool {
        !self.read_only
    }

    async fn check_version(&self) -> ApiResult<(u32, u32)> {
        match self.call(RemoteRequest::CheckVersion).await? {
            RemoteResponse::Version(major, minor) => Ok((major, minor)),
            _ => Err(ApiError::CommError),
        }
    }

    async fn create_directory(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let response = self
            .call(RemoteRequest::CreateDirectory { path: path.as_str().to_string(), meta: meta.clone() })
            .await?;
        Self::expect_unit(response)
    }

    async fn create_file(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let response = self
            .call(RemoteRequest::CreateFile { path: path.as_str().to_string(), meta: meta.clone() })
            .await?;
        Self::expect_unit(response)
    }

    async fn remove_directory(&self, path: &ApiPath) -> ApiResult<()> {
        let response = self.call(RemoteRequest::RemoveDirectory { path: path.as_str().to_string() }).await?;
        Self::expect_unit(response)
    }

    async fn remove_file(&self, path: &ApiPath) -> ApiResult<()> {
        let response = self.call(RemoteRequest::RemoveFile { path: path.as_str().to_string() }).await?;
        Self::expect_unit(response)
    }

    async fn rename_file(&self, src: &ApiPath, dst: &ApiPath) -> ApiResult<()> {
        let response = self
            .call(RemoteRequest::RenameFile { src: src.as_str().to_string(), dst: dst.as_str().to_string() })
            .await?;
        Self::expect_unit(response)
    }

    async fn is_directory(&self, path: &ApiPath) -> ApiResult<bool> {
        let response = self.call(RemoteRequest::IsDirectory { path: path.as_str().to_string() }).await?;
        Self::expect_bool(response)
    }

    async fn is_file(&self, path: &ApiPath) -> ApiResult<bool> {
        let response = self.call(RemoteRequest::IsFile { path: path.as_str().to_string() }).await?;
        Self::expect_bool(response)
    }

    async fn get_item_meta(&self, path: &ApiPath) -> ApiResult<AttributeMap> {
        let response = self.call(RemoteRequest::GetItemMeta { path: path.as_str().to_string() }).await?;
        Self::expect_meta(response)
    }

    async fn set_item_meta_one(&self, path: &ApiPath, key: &str, value: &str) -> ApiResult<()> {
        let response = self
            .call(RemoteRequest::SetItemMetaOne {
                path: path.as_str().to_string(),
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Self::expect_unit(response)
    }

    async fn set_item_meta(&self, path: &ApiPath, meta: &AttributeMap) -> ApiResult<()> {
        let response = self
            .call(RemoteRequest::SetItemMeta { path: path.as_str().to_string(), meta: meta.clone() })
            .await?;
        Self::expect_unit(response)
    }

    async fn remove_item_meta(&self, path: &ApiPath, key: &str) -> ApiResult<()> {
        let response = self
            .call(RemoteRequest::RemoveItemMeta { path: path.as_str().to_string(), key: key.to_string() })
            .await?;
        Self::expect_unit(response)
    }

    async fn get_directory_items(&self, path: &ApiPath) -> ApiResult<Vec<DirectoryItem>> {
        let response = self.call(RemoteRequest::GetDirectoryItems { path: path.as_str().to_string() }).await?;
        match response {
            RemoteResponse::DirectoryItems(items) => items
                .into_iter()
                .map(|item| {
                    Ok(DirectoryItem {
                        api_path: ApiPath::new(&item.api_path).ok_or(ApiError::ItemNotFound)?,
                        directory: item.directory,
                        size: item.size,
                        meta: item.meta,
                    })
                })
                .collect(),
            _ => Err(ApiError::CommError),
        }
    }

    async fn get_file_size(&self, path: &ApiPath) -> ApiResult<u64> {
        let response = self.call(RemoteRequest::GetFileSize { path: path.as_str().to_string() }).await?;
        Self::expect_u64(response)
    }

    async fn get_total_drive_space(&self) -> ApiResult<u64> {
        Self::expect_u64(self.call(RemoteRequest::GetTotalDriveSpace).await?)
    }

    async fn get_used_drive_space(&self) -> ApiResult<u64> {
        Self::expect_u64(self.call(RemoteRequest::GetUsedDriveSpace).await?)
    }

    async fn get_total_item_count(&self) -> ApiResult<u64> {
        Self::expect_u64(self.call(RemoteRequest::GetTotalItemCount).await?)
    }

    async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
        match self.call(RemoteRequest::GetPinnedFiles).await? {
            RemoteResponse::Paths(paths) => {
                paths.iter().map(|p| ApiPath::new(p).ok_or(ApiError::ItemNotFound)).collect()
            }
            _ => Err(ApiError::CommError),
        }
    }

    async fn get_file_list(&self, marker: Option<String>) -> ApiResult<FileListPage> {
        match self.call(RemoteRequest::GetFileList { marker }).await? {
            RemoteResponse::FileList { entries, more_data, next_marker } => {
                let entries = entries
                    .into_iter()
                    .map(|e| {
                        Ok(ApiFile {
                            api_path: ApiPath::new(&e.api_path).ok_or(ApiError::ItemNotFound)?,
                            directory: e.directory,
                            size: e.size,
                        })
                    })
                    .collect::<ApiResult<Vec<_>>>()?;
                Ok(FileListPage { entries, more_data, next_marker })
            }
            _ => Err(ApiError::CommError),
        }
    }

    async fn read_file_bytes(
        &self,
        path: &ApiPath,
        len: u64,
        offset: u64,
        buf: &mut [u8],
        stop: &StopFlag,
    ) -> ApiResult<()> {
        if stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }
        let response =
            self.call(RemoteRequest::ReadFileBytes { path: path.as_str().to_string(), len, offset }).await?;
        match response {
            RemoteResponse::Bytes(bytes) if bytes.len() as u64 == len => {
                buf[..len as usize].copy_from_slice(&bytes);
                Ok(())
            }
            RemoteResponse::Bytes(_) => Err(ApiError::DownloadIncomplete),
            _ => Err(ApiError::CommError),
        }
    }

    async fn upload_file(&self, path: &ApiPath, source_path: &Path, stop: &StopFlag) -> ApiResult<()> {
        if stop.is_stopped() {
            return Err(ApiError::UploadStopped);
        }
        let response = self
            .call(RemoteRequest::UploadFile {
                path: path.as_str().to_string(),
                source_path: source_path.to_string_lossy().to_string(),
            })
            .await?;
        Self::expect_unit(response)
    }

    /// The peer process owns reconciliation against its own backend; this
    /// variant only proves it is reachable and version-compatible.
    async fn start(&self, _sink: Arc<dyn ReconcileSink>, stop: &StopFlag) -> ApiResult<bool> {
        if stop.is_stopped() {
            return Ok(false);
        }
        self.check_version().await?;
        Ok(true)
    }

    async fn stop(&self) {}
}
