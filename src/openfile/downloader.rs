//! Chunk Downloader (§4.4): materializes missing chunks from the provider
//! into an Open File's source file, with read-ahead/read-behind/read-end
//! prefetch and per-chunk deduplication.
//!
//! Embedded in [`super::OpenFile`] rather than a free-standing type -- it has
//! no state of its own beyond the active-chunk map, and every operation needs
//! the Open File's `io` lock and source file.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{ApiError, ApiResult};

/// Deduplicates concurrent download attempts for one chunk index: the first
/// caller to request a chunk spawns the fetch, every later caller for the
/// same index waits on `notify` and reads `result` once it fires.
pub struct ActiveChunk {
    notify: Notify,
    result: std::sync::Mutex<Option<ApiResult<()>>>,
}

impl ActiveChunk {
    fn new() -> Arc<Self> {
        Arc::new(Self { notify: Notify::new(), result: std::sync::Mutex::new(None) })
    }

    fn complete(&self, result: ApiResult<()>) {
        *self.result.lock().unwrap() = Some(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> ApiResult<()> {
        loop {
            // Register interest in the next `notify_waiters()` *before*
            // checking `result`: if `complete()` runs in between the check
            // and the await below, `notify_waiters()` only wakes futures
            // already created, so creating it first is what makes this race
            // safe -- a `Notified` value is guaranteed to observe any
            // notification sent after it was created, even before it's polled.
            let notified = self.notify.notified();
            if let Some(result) = self.result.lock().unwrap().clone() {
                return result;
            }
            notified.await;
        }
    }
}

/// Per-Open-File registry of chunks currently being fetched.
#[derive(Default)]
pub struct ActiveChunkTable {
    inner: tokio::sync::Mutex<HashMap<usize, Arc<ActiveChunk>>>,
}

/// Outcome of registering interest in a chunk: either it is this caller's job
/// to fetch it, or it is already in flight and this caller should wait.
pub enum Registration {
    FetchIt(Arc<ActiveChunk>),
    WaitFor(Arc<ActiveChunk>),
}

impl ActiveChunkTable {
    pub async fn register(&self, index: usize) -> Registration {
        let mut table = self.inner.lock().await;
        if let Some(existing) = table.get(&index) {
            return Registration::WaitFor(existing.clone());
        }
        let entry = ActiveChunk::new();
        table.insert(index, entry.clone());
        Registration::FetchIt(entry)
    }

    pub async fn complete(&self, index: usize, entry: &Arc<ActiveChunk>, result: ApiResult<()>) {
        entry.complete(result);
        self.inner.lock().await.remove(&index);
    }

    pub async fn wait(entry: &Arc<ActiveChunk>) -> ApiResult<()> {
        entry.wait().await
    }
}

/// The set of chunk indices touched by a byte range `[offset, offset+len)`,
/// given a fixed `chunk_size`.
pub fn chunks_touched(offset: u64, len: u64, chunk_size: u64) -> std::ops::RangeInclusive<usize> {
    if len == 0 {
        let idx = (offset / chunk_size) as usize;
        return idx..=idx;
    }
    let first = (offset / chunk_size) as usize;
    let last = ((offset + len - 1) / chunk_size) as usize;
    first..=last
}

/// Chunk indices `[c+1, c+count]` not yet fetched, capped at `chunk_count`.
pub fn read_ahead_targets(c: usize, count: u32, chunk_count: usize) -> Vec<usize> {
    (1..=count as usize).map(|d| c + d).take_while(|&i| i < chunk_count).collect()
}

/// Chunk indices `[c-count, c-1]`, saturating at zero.
pub fn read_behind_targets(c: usize, count: u32) -> Vec<usize> {
    (1..=count as usize)
        .map_while(|d| c.checked_sub(d))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_touched_spans_a_single_chunk() {
        assert_eq!(chunks_touched(10, 5, 100), 0..=0);
    }

    #[test]
    fn chunks_touched_spans_a_boundary() {
        assert_eq!(chunks_touched(95, 10, 100), 0..=1);
    }

    #[test]
    fn zero_length_read_still_touches_its_offset_chunk() {
        assert_eq!(chunks_touched(250, 0, 100), 2..=2);
    }

    #[test]
    fn read_ahead_targets_stop_at_chunk_count() {
        assert_eq!(read_ahead_targets(8, 4, 10), vec![9]);
        assert_eq!(read_ahead_targets(0, 3, 10), vec![1, 2, 3]);
    }

    #[test]
    fn read_behind_targets_saturate_at_zero() {
        assert_eq!(read_behind_targets(1, 3), vec![0]);
        assert_eq!(read_behind_targets(5, 2), vec![4, 3]);
    }

    #[tokio::test]
    async fn second_registration_waits_for_first() {
        let table = ActiveChunkTable::default();
        let first = match table.register(3).await {
            Registration::FetchIt(entry) => entry,
            Registration::WaitFor(_) => panic!("expected to own the fetch"),
        };
        let second = match table.register(3).await {
            Registration::WaitFor(entry) => entry,
            Registration::FetchIt(_) => panic!("expected to wait"),
        };
        assert!(Arc::ptr_eq(&first, &second));

        let waiter = tokio::spawn({
            let second = second.clone();
            async move { ActiveChunkTable::wait(&second).await }
        });
        table.complete(3, &first, Ok(())).await;
        assert!(waiter.await.unwrap().is_ok());
    }
}
