//! The error taxonomy returned by every public operation in this crate.
//!
//! Every provider-level and store-level error is mapped into [`ApiError`] at the
//! boundary where it is produced; nothing above that boundary interprets transport
//! or storage-engine detail directly (see repertory-core's provider contract).

use std::fmt;

/// The closed set of outcomes a core operation can produce.
///
/// This mirrors the taxonomy that the (out of scope) filesystem shim maps onto
/// platform error codes (`ENOENT`, `EEXIST`, ...). Keeping it a plain, exhaustively
/// matchable enum -- rather than a boxed/dynamic error -- means that mapping table
/// can be a total function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApiError {
    Success,
    NotImplemented,
    InvalidOperation,
    InvalidHandle,
    InvalidVersion,
    IncompatibleVersion,
    ItemNotFound,
    ItemExists,
    DirectoryNotFound,
    DirectoryExists,
    DirectoryNotEmpty,
    FileExists,
    FileInUse,
    PermissionDenied,
    AccessDenied,
    BadAddress,
    OsError,
    CommError,
    DownloadFailed,
    DownloadIncomplete,
    DownloadStopped,
    DownloadTimeout,
    UploadFailed,
    UploadStopped,
    XattrNotFound,
    XattrExists,
    XattrBufferSmall,
    XattrTooBig,
    NotSupported,
    MoreData,
    /// Catch-all for a condition with no closer analog in this enum.
    Error,
}

impl ApiError {
    /// `true` for errors that internal retry logic is allowed to treat as transient.
    ///
    /// Only `CommError` and download/upload timeouts are retried automatically;
    /// everything else (including `DownloadStopped`/`UploadStopped`, which are
    /// cooperative-cancellation signals, not failures) is surfaced immediately.
    pub fn is_retryable(self) -> bool {
        matches!(self, ApiError::CommError | ApiError::DownloadTimeout)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ApiError::Success => "success",
            ApiError::NotImplemented => "operation not implemented by this provider",
            ApiError::InvalidOperation => "invalid operation",
            ApiError::InvalidHandle => "invalid handle",
            ApiError::InvalidVersion => "invalid version",
            ApiError::IncompatibleVersion => "incompatible provider version",
            ApiError::ItemNotFound => "item not found",
            ApiError::ItemExists => "item already exists",
            ApiError::DirectoryNotFound => "directory not found",
            ApiError::DirectoryExists => "directory already exists",
            ApiError::DirectoryNotEmpty => "directory not empty",
            ApiError::FileExists => "file already exists",
            ApiError::FileInUse => "file in use",
            ApiError::PermissionDenied => "permission denied",
            ApiError::AccessDenied => "access denied",
            ApiError::BadAddress => "bad address",
            ApiError::OsError => "operating system error",
            ApiError::CommError => "communication error",
            ApiError::DownloadFailed => "download failed",
            ApiError::DownloadIncomplete => "download incomplete",
            ApiError::DownloadStopped => "download stopped",
            ApiError::DownloadTimeout => "download timed out",
            ApiError::UploadFailed => "upload failed",
            ApiError::UploadStopped => "upload stopped",
            ApiError::XattrNotFound => "extended attribute not found",
            ApiError::XattrExists => "extended attribute already exists",
            ApiError::XattrBufferSmall => "extended attribute buffer too small",
            ApiError::XattrTooBig => "extended attribute value too big",
            ApiError::NotSupported => "not supported",
            ApiError::MoreData => "more data available",
            ApiError::Error => "error",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ApiError {}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => ApiError::ItemNotFound,
            AlreadyExists => ApiError::ItemExists,
            PermissionDenied => ApiError::AccessDenied,
            TimedOut => ApiError::DownloadTimeout,
            _ => ApiError::OsError,
        }
    }
}

/// Result alias used throughout the crate.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
