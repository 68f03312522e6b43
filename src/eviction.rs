//! Eviction Hook (§4.6): reclaims cache space by deleting the local copy of
//! a file whose remote copy is already known to match it.
//!
//! Every precondition below has to hold at the same instant for an eviction
//! to proceed; `evict_file` re-checks all of them right before deleting so a
//! candidate gathered a moment earlier (e.g. by the poller) can't be evicted
//! after something invalidated it:
//!
//! - the provider is not read-only (an encrypted-passthrough mount has no
//!   separate cache copy to reclaim -- the "cache" *is* the source)
//! - the path is not pinned
//! - the path has no pending resume entry (an evicted file with a resume
//!   entry would silently restart its download from scratch, which is worse
//!   than just leaving it cached)
//! - the path has no open handles and its Open File (if tracked) is
//!   complete and unmodified
//! - the path is not queued or in flight on the Upload Queue
//! - the on-disk size still matches the size recorded for it

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::accountant::CacheAccountant;
use crate::error::{ApiError, ApiResult};
use crate::events::{Event, EventBus};
use crate::openfile::OpenFile;
use crate::path::ApiPath;
use crate::provider::Provider;
use crate::store::{FileDb, MetadataStore};
use crate::upload_queue::UploadQueue;

/// One item the poller considers for reclamation.
pub struct EvictionCandidate {
    pub api_path: ApiPath,
    pub source_path: PathBuf,
    pub known_size: u64,
}

pub struct EvictionHook {
    provider: Arc<dyn Provider>,
    metadata: Arc<dyn MetadataStore>,
    file_db: Arc<dyn FileDb>,
    uploads: Arc<UploadQueue>,
    accountant: Arc<CacheAccountant>,
    events: EventBus,
}

impl EvictionHook {
    pub fn new(
        provider: Arc<dyn Provider>,
        metadata: Arc<dyn MetadataStore>,
        file_db: Arc<dyn FileDb>,
        uploads: Arc<UploadQueue>,
        accountant: Arc<CacheAccountant>,
        events: EventBus,
    ) -> Self {
        Self { provider, metadata, file_db, uploads, accountant, events }
    }

    /// Attempt to evict one candidate. `open_file` is `Some` when the path
    /// currently has a tracked Open File (open or cached-clean); `None` means
    /// no in-memory state exists for it at all, so only the on-disk and
    /// store-level preconditions apply.
    ///
    /// Returns `Ok(true)` if the cache copy was deleted, `Ok(false)` if a
    /// precondition failed (routine -- the caller just tries the next
    /// candidate), or `Err` on an I/O failure while deleting.
    pub async fn evict_file(
        &self,
        open_file: Option<&Arc<OpenFile>>,
        candidate: &EvictionCandidate,
        has_resume_entry: bool,
    ) -> ApiResult<bool> {
        if self.provider.is_read_only() {
            return Ok(false);
        }
        if has_resume_entry {
            return Ok(false);
        }
        if self.metadata.get_pinned(&candidate.api_path).await.unwrap_or(true) {
            return Ok(false);
        }
        if self.uploads.is_queued(&candidate.api_path).await
            || self.uploads.is_processing(&candidate.api_path).await
        {
            return Ok(false);
        }
        if let Some(of) = open_file {
            if of.handle_count().await != 0 {
                return Ok(false);
            }
            if of.is_modified().await || !of.is_complete().await {
                return Ok(false);
            }
        }

        let on_disk_size = match tokio::fs::metadata(&candidate.source_path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(ApiError::from(err)),
        };
        if on_disk_size != candidate.known_size {
            return Ok(false);
        }

        if let Err(err) = tokio::fs::remove_file(&candidate.source_path).await {
            warn!(%err, api_path = %candidate.api_path, "failed to delete cache file during eviction");
            return Err(ApiError::from(err));
        }
        self.accountant.update(candidate.known_size, 0, true);

        // The path itself stays in the Metadata Store / File DB (§4.6) --
        // only the now-deleted cache file's reference is cleared, so a later
        // open re-materializes a fresh source file instead of pointing at
        // nothing.
        if let Err(err) = self.metadata.remove_item_meta(&candidate.api_path, "source").await {
            warn!(%err, api_path = %candidate.api_path, "failed to clear source_path attribute after eviction");
        }
        if let Ok(mut row) = self.file_db.get_item_by_api_path(&candidate.api_path).await {
            row.source_path = None;
            if let Err(err) = self.file_db.add_or_update_file(row).await {
                warn!(%err, api_path = %candidate.api_path, "failed to clear source_path in file db after eviction");
            }
        }

        info!(api_path = %candidate.api_path, "evicted cache copy");
        self.events.publish(Event::FilesystemItemEvicted { api_path: candidate.api_path.to_string() });
        Ok(true)
    }
}
