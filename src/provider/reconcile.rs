//! Shared "reconcile on start" helper used by the object-store and renterd
//! variants.
//!
//! This is a free function parameterized over the concrete variant's list
//! primitive rather than a base-class method, since Rust has no
//! implementation inheritance; each variant's `start()` calls it after its
//! own connectivity check. The Metadata Store and cache directory live with
//! the File Manager, not the provider, so this helper only talks to them
//! through the [`ReconcileSink`] capability rather than holding a
//! back-pointer to the manager.
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::ApiResult;
use crate::provider::{FileListPage, ReconcileSink, StopFlag};

/// Enumerate the full remote namespace via repeated calls to `list_page`,
/// reporting each discovered item to `sink`, then sweep the sink's cache
/// directory for source files with no owning item and delete them. Cancellable
/// via `stop`.
pub async fn reconcile_on_start<F>(
    mut list_page: F,
    sink: Arc<dyn ReconcileSink>,
    stop: &StopFlag,
) -> ApiResult<()>
where
    F: FnMut(
        Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ApiResult<FileListPage>> + Send>>,
{
    let mut marker: Option<String> = None;
    let mut discovered = 0usize;
    loop {
        if stop.is_stopped() {
            info!("provider reconciliation cancelled after {discovered} items");
            return Ok(());
        }
        let page = list_page(marker.clone()).await?;
        for entry in page.entries {
            discovered += 1;
            sink.on_item_discovered(entry).await;
        }
        if !page.more_data {
            break;
        }
        marker = page.next_marker;
    }
    sink.on_reconcile_complete().await;
    info!("provider reconciliation discovered {discovered} items");

    sweep_orphan_source_files(&sink.cache_directory(), &sink.known_source_paths().await).await;
    Ok(())
}

/// Delete cache-directory entries that no item references.
async fn sweep_orphan_source_files(
    cache_directory: &std::path::Path,
    known_source_paths: &std::collections::HashSet<std::path::PathBuf>,
) {
    let mut dir = match tokio::fs::read_dir(cache_directory).await {
        Ok(dir) => dir,
        Err(err) => {
            warn!(%err, "could not scan cache directory for orphans");
            return;
        }
    };

    let mut removed = 0usize;
    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "error while scanning cache directory");
                break;
            }
        };
        let path = entry.path();
        if known_source_paths.contains(&path) {
            continue;
        }
        if tokio::fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        info!("removed {removed} orphan source files from cache directory");
    }
}
