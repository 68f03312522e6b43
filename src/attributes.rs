//! Per-item attribute map.
//!
//! Persisted as a string-to-string dictionary because that is the representation
//! the Metadata Store writes to disk; this module adds a typed accessor layer over
//! the reserved keys so call sites do not sprinkle string literals everywhere.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Reserved attribute keys. Anything not in this list is a user-defined xattr.
pub const RESERVED_KEYS: &[&str] = &[
    "size", "mode", "uid", "gid", "attributes", "accessed", "modified", "written",
    "changed", "creation", "backup", "osxflags", "source", "pinned", "key",
    "resume_state",
];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// String -> string dictionary backing one filesystem item's metadata.
///
/// `Serialize`/`Deserialize` let the Metadata Store persist the whole map as
/// one JSON blob alongside the indexed columns it pulls out for querying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMap(HashMap<String, String>);

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// User-defined extended attributes only (excludes the reserved set).
    pub fn xattrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, _)| !is_reserved_key(k))
    }

    // -- typed accessors over the reserved keys --

    pub fn size(&self) -> u64 {
        self.get("size").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    pub fn set_size(&mut self, size: u64) {
        self.set("size", size.to_string());
    }

    pub fn mode(&self) -> u32 {
        self.get("mode").and_then(|v| v.parse().ok()).unwrap_or(0o644)
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.set("mode", mode.to_string());
    }

    pub fn uid(&self) -> u32 {
        self.get("uid").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    pub fn gid(&self) -> u32 {
        self.get("gid").and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// `true` when the `pinned` attribute is present and non-zero.
    pub fn pinned(&self) -> bool {
        matches!(self.get("pinned"), Some(v) if v != "0" && !v.is_empty())
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.set("pinned", if pinned { "1" } else { "0" });
    }

    pub fn source(&self) -> Option<&str> {
        self.get("source").filter(|v| !v.is_empty())
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.set("source", source.into());
    }

    pub fn key(&self) -> Option<&str> {
        self.get("key")
    }

    fn timestamp_ns(&self, attr: &str) -> u128 {
        self.get(attr).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    fn set_timestamp_ns(&mut self, attr: &str, ns: u128) {
        self.set(attr, ns.to_string());
    }

    pub fn accessed_ns(&self) -> u128 {
        self.timestamp_ns("accessed")
    }
    pub fn modified_ns(&self) -> u128 {
        self.timestamp_ns("modified")
    }
    pub fn written_ns(&self) -> u128 {
        self.timestamp_ns("written")
    }
    pub fn changed_ns(&self) -> u128 {
        self.timestamp_ns("changed")
    }

    pub fn touch_accessed(&mut self) {
        self.set_timestamp_ns("accessed", now_ns());
    }

    pub fn touch_modified_written_changed(&mut self) {
        let now = now_ns();
        self.set_timestamp_ns("modified", now);
        self.set_timestamp_ns("written", now);
        self.set_timestamp_ns("changed", now);
    }
}

/// Decimal nanoseconds since the Unix epoch, this crate's timestamp encoding.
pub fn now_ns() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}
