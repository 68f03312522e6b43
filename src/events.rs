//! Typed event stream observed by the host.
//!
//! Every event carries a one-line human summary plus a small JSON body. Events are
//! pushed onto a bounded [`tokio::sync::broadcast`] channel so multiple subscribers
//! (a CLI status line, a GUI, a remote-mount peer) can drain the same stream; a slow
//! or absent subscriber never blocks the producer, it just misses events (reported
//! to `tracing` as a lagged-receiver warning when it resubscribes).

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// One typed occurrence in the core's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DriveMounted,
    DriveUnmounted,
    ServiceStartBegin,
    ServiceStartEnd,
    ServiceStopBegin,
    ServiceStopEnd,
    FilesystemItemOpened { api_path: String },
    FilesystemItemHandleOpened { api_path: String, handle: u64 },
    FilesystemItemHandleClosed { api_path: String, handle: u64 },
    FilesystemItemClosed { api_path: String },
    FilesystemItemEvicted { api_path: String },
    FileUploadQueued { api_path: String },
    FileUploadCompleted { api_path: String },
    FailedUploadQueued { api_path: String },
    FailedUploadRetry { api_path: String, attempts: u32 },
    DownloadBegin { api_path: String, chunk: u64 },
    DownloadEnd { api_path: String, chunk: u64 },
    DownloadProgress { api_path: String, chunk: u64, total_chunks: u64 },
    DownloadRestored { api_path: String },
    DownloadResumeAdded { api_path: String },
    DownloadResumeRemoved { api_path: String },
    ItemTimeout { api_path: String },
    PollingItemBegin { name: String },
    PollingItemEnd { name: String },
    RepertoryException { code: String, message: String, context_path: Option<String> },
}

impl Event {
    /// One-line human summary, independent of the JSON body.
    pub fn summary(&self) -> String {
        match self {
            Event::DriveMounted => "drive mounted".into(),
            Event::DriveUnmounted => "drive unmounted".into(),
            Event::ServiceStartBegin => "service start begin".into(),
            Event::ServiceStartEnd => "service start end".into(),
            Event::ServiceStopBegin => "service stop begin".into(),
            Event::ServiceStopEnd => "service stop end".into(),
            Event::FilesystemItemOpened { api_path } => format!("opened {api_path}"),
            Event::FilesystemItemHandleOpened { api_path, handle } => {
                format!("handle {handle} opened on {api_path}")
            }
            Event::FilesystemItemHandleClosed { api_path, handle } => {
                format!("handle {handle} closed on {api_path}")
            }
            Event::FilesystemItemClosed { api_path } => format!("closed {api_path}"),
            Event::FilesystemItemEvicted { api_path } => format!("evicted {api_path}"),
            Event::FileUploadQueued { api_path } => format!("queued upload for {api_path}"),
            Event::FileUploadCompleted { api_path } => format!("upload completed for {api_path}"),
            Event::FailedUploadQueued { api_path } => format!("upload failed, queued {api_path}"),
            Event::FailedUploadRetry { api_path, attempts } => {
                format!("upload retry #{attempts} for {api_path}")
            }
            Event::DownloadBegin { api_path, chunk } => format!("download begin {api_path}#{chunk}"),
            Event::DownloadEnd { api_path, chunk } => format!("download end {api_path}#{chunk}"),
            Event::DownloadProgress { api_path, chunk, total_chunks } => {
                format!("download progress {api_path} {chunk}/{total_chunks}")
            }
            Event::DownloadRestored { api_path } => format!("download restored for {api_path}"),
            Event::DownloadResumeAdded { api_path } => format!("resume entry added for {api_path}"),
            Event::DownloadResumeRemoved { api_path } => format!("resume entry removed for {api_path}"),
            Event::ItemTimeout { api_path } => format!("idle timeout on {api_path}"),
            Event::PollingItemBegin { name } => format!("poll begin {name}"),
            Event::PollingItemEnd { name } => format!("poll end {name}"),
            Event::RepertoryException { code, message, .. } => format!("{code}: {message}"),
        }
    }

    /// JSON body carried alongside the summary.
    pub fn body(&self) -> Value {
        serde_json::to_value(EventBody::from(self)).unwrap_or(Value::Null)
    }
}

/// Serializable mirror of [`Event`], kept separate so the public enum can stay
/// plain Rust (no serde bounds required on callers that only match on it).
#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventBody {
    DriveMounted,
    DriveUnmounted,
    ServiceStartBegin,
    ServiceStartEnd,
    ServiceStopBegin,
    ServiceStopEnd,
    FilesystemItemOpened { api_path: String },
    FilesystemItemHandleOpened { api_path: String, handle: u64 },
    FilesystemItemHandleClosed { api_path: String, handle: u64 },
    FilesystemItemClosed { api_path: String },
    FilesystemItemEvicted { api_path: String },
    FileUploadQueued { api_path: String },
    FileUploadCompleted { api_path: String },
    FailedUploadQueued { api_path: String },
    FailedUploadRetry { api_path: String, attempts: u32 },
    DownloadBegin { api_path: String, chunk: u64 },
    DownloadEnd { api_path: String, chunk: u64 },
    DownloadProgress { api_path: String, chunk: u64, total_chunks: u64 },
    DownloadRestored { api_path: String },
    DownloadResumeAdded { api_path: String },
    DownloadResumeRemoved { api_path: String },
    ItemTimeout { api_path: String },
    PollingItemBegin { name: String },
    PollingItemEnd { name: String },
    RepertoryException { code: String, message: String, context_path: Option<String> },
}

impl From<&Event> for EventBody {
    fn from(ev: &Event) -> Self {
        match ev.clone() {
            Event::DriveMounted => EventBody::DriveMounted,
            Event::DriveUnmounted => EventBody::DriveUnmounted,
            Event::ServiceStartBegin => EventBody::ServiceStartBegin,
            Event::ServiceStartEnd => EventBody::ServiceStartEnd,
            Event::ServiceStopBegin => EventBody::ServiceStopBegin,
            Event::ServiceStopEnd => EventBody::ServiceStopEnd,
            Event::FilesystemItemOpened { api_path } => EventBody::FilesystemItemOpened { api_path },
            Event::FilesystemItemHandleOpened { api_path, handle } => {
                EventBody::FilesystemItemHandleOpened { api_path, handle }
            }
            Event::FilesystemItemHandleClosed { api_path, handle } => {
                EventBody::FilesystemItemHandleClosed { api_path, handle }
            }
            Event::FilesystemItemClosed { api_path } => EventBody::FilesystemItemClosed { api_path },
            Event::FilesystemItemEvicted { api_path } => EventBody::FilesystemItemEvicted { api_path },
            Event::FileUploadQueued { api_path } => EventBody::FileUploadQueued { api_path },
            Event::FileUploadCompleted { api_path } => EventBody::FileUploadCompleted { api_path },
            Event::FailedUploadQueued { api_path } => EventBody::FailedUploadQueued { api_path },
            Event::FailedUploadRetry { api_path, attempts } => {
                EventBody::FailedUploadRetry { api_path, attempts }
            }
            Event::DownloadBegin { api_path, chunk } => EventBody::DownloadBegin { api_path, chunk },
            Event::DownloadEnd { api_path, chunk } => EventBody::DownloadEnd { api_path, chunk },
            Event::DownloadProgress { api_path, chunk, total_chunks } => {
                EventBody::DownloadProgress { api_path, chunk, total_chunks }
            }
            Event::DownloadRestored { api_path } => EventBody::DownloadRestored { api_path },
            Event::DownloadResumeAdded { api_path } => EventBody::DownloadResumeAdded { api_path },
            Event::DownloadResumeRemoved { api_path } => EventBody::DownloadResumeRemoved { api_path },
            Event::ItemTimeout { api_path } => EventBody::ItemTimeout { api_path },
            Event::PollingItemBegin { name } => EventBody::PollingItemBegin { name },
            Event::PollingItemEnd { name } => EventBody::PollingItemEnd { name },
            Event::RepertoryException { code, message, context_path } => {
                EventBody::RepertoryException { code, message, context_path }
            }
        }
    }
}

/// Fan-out event stream shared by every component.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event: mirror it to `tracing` at an appropriate level and push
    /// it onto the broadcast channel. A full channel with no subscribers is not an
    /// error -- `send` only fails when there are zero receivers, which is routine.
    pub fn publish(&self, event: Event) {
        let summary = event.summary();
        match &event {
            Event::RepertoryException { .. } | Event::ItemTimeout { .. } => error!(%summary),
            Event::FailedUploadQueued { .. } | Event::FailedUploadRetry { .. } => warn!(%summary),
            _ => info!(%summary),
        }
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
