//! Cache-Space Accountant: tracks bytes consumed by source files under the
//! cache directory and enforces a configurable maximum.
//!
//! Every size change anywhere in the crate -- a chunk download landing on
//! disk, a write extending a file, an eviction deleting a source file --
//! routes through [`CacheAccountant::update`] so a single atomic counter stays
//! the one source of truth for "how much of the cache directory is spoken
//! for". This is deliberately not a per-item accounting structure: callers
//! that need per-path sizes already have them in the Metadata Store.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Single atomic counter shared by every component that changes a source
/// file's on-disk size. Cheap to clone (an `Arc` around this is how the rest
/// of the crate passes it around).
#[derive(Debug)]
pub struct CacheAccountant {
    used: AtomicU64,
    limit: u64,
}

impl CacheAccountant {
    pub fn new(limit: u64) -> Self {
        Self { used: AtomicU64::new(0), limit }
    }

    /// Build an accountant by walking `cache_directory` and summing the size
    /// of every regular file found directly inside it. Called once at
    /// `FileManager::start`.
    pub async fn scan(cache_directory: &Path, limit: u64) -> std::io::Result<Self> {
        let mut total = 0u64;
        match tokio::fs::read_dir(cache_directory).await {
            Ok(mut dir) => {
                while let Some(entry) = dir.next_entry().await? {
                    if let Ok(meta) = entry.metadata().await {
                        if meta.is_file() {
                            total += meta.len();
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(cache_directory).await?;
            }
            Err(err) => return Err(err),
        }
        Ok(Self { used: AtomicU64::new(total), limit })
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Record that a source file's on-disk size changed from `old` to `new`.
    /// `cache_only` is informational for callers distinguishing an eviction
    /// delete (cache-only, the remote copy survives) from other size changes;
    /// the accountant itself treats every delta the same.
    pub fn update(&self, old: u64, new: u64, _cache_only: bool) {
        if new >= old {
            self.used.fetch_add(new - old, Ordering::AcqRel);
        } else {
            self.used.fetch_sub(old - new, Ordering::AcqRel);
        }
    }

    /// Fraction of `limit` currently used, `0.0` if there is no limit.
    pub fn usage_ratio(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used() as f64 / self.limit as f64
    }

    /// `true` once usage meets or exceeds `watermark` (0.0-1.0) of the limit.
    pub fn over_watermark(&self, watermark: f64) -> bool {
        self.limit != 0 && self.usage_ratio() >= watermark
    }
}
