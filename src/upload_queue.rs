//! Upload Queue (§4.5): pushes dirty source files to the provider in the
//! background, retrying on failure with backoff, at most one entry per
//! `api_path`.
//!
//! A later [`UploadQueue::queue_upload`] for a path already queued replaces
//! the pending entry rather than adding a second one -- the File Manager only
//! ever needs the latest source file for a path uploaded, never every
//! intermediate write.
//!
//! Retry/requeue semantics: the *first* time a path is queued, `FileUploadQueued`
//! fires. Every subsequent attempt is a retry of that same logical upload, so a
//! failure on attempt 1 fires `FailedUploadQueued` and every failure after that
//! fires `FailedUploadRetry` with the attempt count; only a clean success clears
//! the entry and fires `FileUploadCompleted`. Nothing here ever gives up on its
//! own -- an operator has to evict or remove the path to stop the retries.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ApiResult;
use crate::events::{Event, EventBus};
use crate::path::ApiPath;
use crate::provider::{Provider, StopFlag};

#[derive(Debug, Clone)]
struct UploadEntry {
    source_path: PathBuf,
    attempts: u32,
}

struct Inner {
    /// FIFO order of distinct paths currently queued. A path re-queued while
    /// already present keeps its original position; only the entry (source
    /// path, attempt count is left alone) is replaced.
    order: VecDeque<ApiPath>,
    entries: HashMap<ApiPath, UploadEntry>,
    processing: Option<ApiPath>,
    paused: bool,
}

/// Background worker coordinating uploads for one File Manager instance.
pub struct UploadQueue {
    provider: Arc<dyn Provider>,
    events: EventBus,
    base_backoff: Duration,
    max_backoff: Duration,
    stop: StopFlag,
    inner: Mutex<Inner>,
    wake: Notify,
}

impl UploadQueue {
    pub fn new(provider: Arc<dyn Provider>, events: EventBus, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            provider,
            events,
            base_backoff: config.upload_retry_base_backoff,
            max_backoff: config.upload_retry_max_backoff,
            stop: StopFlag::new(),
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                processing: None,
                paused: false,
            }),
            wake: Notify::new(),
        })
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let scaled = self.base_backoff.saturating_mul(attempts.max(1));
        scaled.min(self.max_backoff)
    }

    /// Enqueue (or replace) the pending upload for `api_path`. If this is the
    /// path's first time in the queue, fires `FileUploadQueued`.
    pub async fn queue_upload(&self, api_path: ApiPath, source_path: PathBuf) {
        let mut inner = self.inner.lock().await;
        let first_time = !inner.entries.contains_key(&api_path);
        if first_time {
            inner.order.push_back(api_path.clone());
        }
        inner.entries.insert(api_path.clone(), UploadEntry { source_path, attempts: 0 });
        drop(inner);
        if first_time {
            self.events.publish(Event::FileUploadQueued { api_path: api_path.to_string() });
        }
        self.wake.notify_one();
    }

    /// Drop a pending entry (e.g. the item was removed before its upload
    /// ran). No-op if the path is not queued or is the one currently
    /// in-flight -- a caller that needs to cancel an in-flight upload must
    /// wait for it via [`Self::is_processing`] first.
    pub async fn remove_upload(&self, api_path: &ApiPath) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(api_path).is_some() {
            inner.order.retain(|p| p != api_path);
            true
        } else {
            false
        }
    }

    pub async fn is_processing(&self, api_path: &ApiPath) -> bool {
        self.inner.lock().await.processing.as_ref() == Some(api_path)
    }

    pub async fn is_queued(&self, api_path: &ApiPath) -> bool {
        self.inner.lock().await.entries.contains_key(api_path)
    }

    /// Move a pending entry from `from` to `to`, preserving its attempt
    /// count and queue position. Returns `Err(())` if `from` is currently
    /// being uploaded -- the caller (File Manager rename) must retry once
    /// the in-flight attempt finishes rather than rename out from under it.
    pub async fn rename(&self, from: &ApiPath, to: &ApiPath) -> Result<(), ()> {
        let mut inner = self.inner.lock().await;
        if inner.processing.as_ref() == Some(from) {
            return Err(());
        }
        if let Some(entry) = inner.entries.remove(from) {
            for slot in inner.order.iter_mut() {
                if slot == from {
                    *slot = to.clone();
                }
            }
            inner.entries.insert(to.clone(), entry);
        }
        Ok(())
    }

    pub async fn pause(&self) {
        self.inner.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        self.inner.lock().await.paused = false;
        self.wake.notify_one();
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Drain the queue: process every remaining entry once, without
    /// retrying failures, until the queue is empty or `deadline` elapses.
    /// Used by `FileManager::stop` to give in-flight work a bounded chance
    /// to finish before forcing a shutdown.
    pub async fn drain(&self, deadline: Duration) {
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() >= deadline {
                warn!("upload queue drain deadline reached with entries still pending");
                return;
            }
            let next = self.next_entry().await;
            let Some((api_path, entry)) = next else { return };
            let _ = self.attempt_upload(&api_path, &entry).await;
        }
    }

    async fn next_entry(&self) -> Option<(ApiPath, UploadEntry)> {
        let mut inner = self.inner.lock().await;
        if inner.paused {
            return None;
        }
        let api_path = inner.order.front()?.clone();
        let entry = inner.entries.get(&api_path)?.clone();
        inner.processing = Some(api_path.clone());
        Some((api_path, entry))
    }

    /// One upload attempt. On success, the entry (and its queue slot) is
    /// removed. On failure, the entry is left in place with `attempts`
    /// incremented so the worker loop's caller can decide whether to sleep
    /// and retry (background loop) or move on (drain).
    async fn attempt_upload(&self, api_path: &ApiPath, entry: &UploadEntry) -> ApiResult<()> {
        let attempts = entry.attempts + 1;
        let result = self.provider.upload_file(api_path, &entry.source_path, &self.stop).await;
        let mut inner = self.inner.lock().await;
        inner.processing = None;
        match &result {
            Ok(()) => {
                inner.entries.remove(api_path);
                inner.order.retain(|p| p != api_path);
                drop(inner);
                info!(%api_path, "upload completed");
                self.events.publish(Event::FileUploadCompleted { api_path: api_path.to_string() });
            }
            Err(err) => {
                if let Some(existing) = inner.entries.get_mut(api_path) {
                    existing.attempts = attempts;
                }
                drop(inner);
                warn!(%api_path, %err, attempts, "upload attempt failed");
                if attempts == 1 {
                    self.events.publish(Event::FailedUploadQueued { api_path: api_path.to_string() });
                } else {
                    self.events.publish(Event::FailedUploadRetry { api_path: api_path.to_string(), attempts });
                }
            }
        }
        result
    }

    /// Spawn the background worker loop. Runs until `stop()` is called.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.stop.is_stopped() {
                    return;
                }
                let next = this.next_entry().await;
                let Some((api_path, entry)) = next else {
                    tokio::select! {
                        _ = this.wake.notified() => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                };
                if this.attempt_upload(&api_path, &entry).await.is_err() {
                    let attempts = this
                        .inner
                        .lock()
                        .await
                        .entries
                        .get(&api_path)
                        .map(|e| e.attempts)
                        .unwrap_or(1);
                    tokio::time::sleep(this.backoff(attempts)).await;
                }
            }
        });
    }

    pub fn stop(&self) {
        self.stop.stop();
        self.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeMap;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FlakyProvider {
        fail_until_attempt: u32,
        attempts: AtomicU32,
        uploaded: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        async fn check_version(&self) -> ApiResult<(u32, u32)> {
            Ok((1, 1))
        }
        async fn create_directory(&self, _: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            Ok(())
        }
        async fn create_file(&self, _: &ApiPath, _: &AttributeMap) -> ApiResult<()> {
            Ok(())
        }
        async fn remove_directory(&self, _: &ApiPath) -> ApiResult<()> {
            Ok(())
        }
        async fn remove_file(&self, _: &ApiPath) -> ApiResult<()> {
            Ok(())
        }
        async fn is_directory(&self, _: &ApiPath) -> ApiResult<bool> {
            Ok(false)
        }
        async fn is_file(&self, _: &ApiPath) -> ApiResult<bool> {
            Ok(true)
        }
        async fn get_item_meta(&self, _: &ApiPath) -> ApiResult<AttributeMap> {
            Ok(AttributeMap::new())
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
        async fn get_directory_items(&self, _: &ApiPath) -> ApiResult<Vec<crate::provider::DirectoryItem>> {
            Ok(Vec::new())
        }
        async fn get_file_size(&self, _: &ApiPath) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_total_drive_space(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_used_drive_space(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_total_item_count(&self) -> ApiResult<u64> {
            Ok(0)
        }
        async fn get_pinned_files(&self) -> ApiResult<Vec<ApiPath>> {
            Ok(Vec::new())
        }
        async fn get_file_list(&self, _: Option<String>) -> ApiResult<crate::provider::FileListPage> {
            Ok(crate::provider::FileListPage { entries: Vec::new(), more_data: false, next_marker: None })
        }
        async fn read_file_bytes(
            &self,
            _: &ApiPath,
            _: u64,
            _: u64,
            _: &mut [u8],
            _: &StopFlag,
        ) -> ApiResult<()> {
            Ok(())
        }
        async fn upload_file(&self, path: &ApiPath, _source_path: &Path, _stop: &StopFlag) -> ApiResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < self.fail_until_attempt {
                return Err(crate::error::ApiError::CommError);
            }
            self.uploaded.lock().unwrap().push(path.as_str().to_string());
            Ok(())
        }
        async fn start(
            &self,
            _sink: Arc<dyn crate::provider::ReconcileSink>,
            _stop: &StopFlag,
        ) -> ApiResult<bool> {
            Ok(true)
        }
        async fn stop(&self) {}
    }

    fn zero_backoff_config() -> Config {
        let mut cfg = Config::default();
        cfg.upload_retry_base_backoff = Duration::ZERO;
        cfg.upload_retry_max_backoff = Duration::ZERO;
        cfg
    }

    #[tokio::test]
    async fn successful_upload_clears_the_entry_and_fires_completed() {
        let provider =
            Arc::new(FlakyProvider { fail_until_attempt: 1, attempts: AtomicU32::new(0), uploaded: StdMutex::new(Vec::new()) });
        let events = EventBus::new();
        let mut subscriber = events.subscribe();
        let queue = UploadQueue::new(provider.clone(), events, &zero_backoff_config());
        queue.start();

        let api_path = ApiPath::new("/a.bin").unwrap();
        queue.queue_upload(api_path.clone(), PathBuf::from("/tmp/a")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while queue.is_queued(&api_path).await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!queue.is_queued(&api_path).await);
        assert_eq!(provider.uploaded.lock().unwrap().as_slice(), &["/a.bin".to_string()]);

        let mut saw_queued = false;
        let mut saw_completed = false;
        while let Ok(event) = subscriber.try_recv() {
            match event {
                Event::FileUploadQueued { .. } => saw_queued = true,
                Event::FileUploadCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_queued && saw_completed);
    }

    #[tokio::test]
    async fn failures_retry_until_success() {
        let provider = Arc::new(FlakyProvider {
            fail_until_attempt: 3,
            attempts: AtomicU32::new(0),
            uploaded: StdMutex::new(Vec::new()),
        });
        let queue = UploadQueue::new(provider.clone(), EventBus::new(), &zero_backoff_config());
        queue.start();

        let api_path = ApiPath::new("/b.bin").unwrap();
        queue.queue_upload(api_path.clone(), PathBuf::from("/tmp/b")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while queue.is_queued(&api_path).await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(provider.attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(provider.uploaded.lock().unwrap().as_slice(), &["/b.bin".to_string()]);
    }

    #[tokio::test]
    async fn rename_moves_a_pending_entry() {
        let provider =
            Arc::new(FlakyProvider { fail_until_attempt: 1, attempts: AtomicU32::new(0), uploaded: StdMutex::new(Vec::new()) });
        let queue = UploadQueue::new(provider, EventBus::new(), &zero_backoff_config());
        queue.pause().await;

        let from = ApiPath::new("/old").unwrap();
        let to = ApiPath::new("/new").unwrap();
        queue.queue_upload(from.clone(), PathBuf::from("/tmp/x")).await;
        queue.rename(&from, &to).await.unwrap();

        assert!(!queue.is_queued(&from).await);
        assert!(queue.is_queued(&to).await);
    }
}
