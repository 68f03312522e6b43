//! Core open-file / file-manager / chunk-download / upload-retry subsystem for a
//! remote-object-store-backed mount, plus the provider interface contract it drives.
//!
//! This crate covers the hard engineering of preserving POSIX/Win32 file semantics
//! on top of an object store with no partial-write and no rename-of-open-file: the
//! open-file table and its per-handle lifecycle, a chunk download engine with
//! read-ahead/read-behind/read-end prefetch and idle timeout, an upload retry
//! queue, bounded cache usage via eviction, and download resume across process
//! restarts. The OS-level filesystem shim, the HTTP client transport, process
//! bootstrap/CLI, and the embedded key-value stores' physical engines are external
//! collaborators -- only the operations and metadata this crate exchanges with them
//! are modeled here.

pub mod accountant;
pub mod attributes;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod eviction;
pub mod file_manager;
pub mod item;
pub mod openfile;
pub mod path;
pub mod poller;
pub mod provider;
pub mod store;
pub mod upload_queue;

pub use accountant::CacheAccountant;
pub use attributes::AttributeMap;
pub use config::{Config, ProviderKind};
pub use error::{ApiError, ApiResult};
pub use events::{Event, EventBus};
pub use file_manager::FileManager;
pub use item::FilesystemItem;
pub use openfile::{Handle, OpenFile, OpenFlags};
pub use path::ApiPath;
pub use provider::{Provider, StopFlag};
