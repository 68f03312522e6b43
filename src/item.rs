//! Everything the core tracks about one logical path.

use crate::attributes::AttributeMap;
use crate::path::ApiPath;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Everything the core knows about one path, independent of whether it is
/// currently open.
#[derive(Debug, Clone)]
pub struct FilesystemItem {
    pub api_path: ApiPath,
    pub directory: bool,
    pub size: u64,
    /// Absolute path of the local cache file backing this item. Empty until the
    /// item is first materialized (invariant: read through [`Self::source_path`]).
    source_path: Option<std::path::PathBuf>,
    /// Opaque provider-assigned id, non-empty only for encrypted providers.
    pub encryption_token: Option<String>,
    pub attributes: AttributeMap,
}

impl FilesystemItem {
    pub fn new_directory(api_path: ApiPath) -> Self {
        Self {
            api_path,
            directory: true,
            size: 0,
            source_path: None,
            encryption_token: None,
            attributes: AttributeMap::new(),
        }
    }

    pub fn new_file(api_path: ApiPath) -> Self {
        Self {
            api_path,
            directory: false,
            size: 0,
            source_path: None,
            encryption_token: None,
            attributes: AttributeMap::new(),
        }
    }

    pub fn source_path(&self) -> Option<&std::path::Path> {
        self.source_path.as_deref()
    }

    pub fn set_source_path(&mut self, path: std::path::PathBuf) {
        self.source_path = Some(path);
    }

    pub fn clear_source_path(&mut self) {
        self.source_path = None;
    }

    pub fn api_parent(&self) -> Option<ApiPath> {
        self.api_path.parent()
    }
}

/// Per-path lock serializing attribute mutations.
///
/// Kept as a thin wrapper so call sites read as "lock this item's metadata",
/// not "lock a generic mutex".
#[derive(Clone)]
pub struct MetaLock(Arc<AsyncMutex<()>>);

impl MetaLock {
    pub fn new() -> Self {
        Self(Arc::new(AsyncMutex::new(())))
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

impl Default for MetaLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetaLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MetaLock")
    }
}
