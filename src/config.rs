//! Runtime configuration.
//!
//! Parsing the config *file* (location discovery, CLI overlay) is the host's job;
//! this module only owns the `Config` shape and its defaults, since every
//! component below borrows from it.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which backend a [`crate::provider::Provider`] talks to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    ObjectStore { bucket: String, endpoint: String, access_key: String, secret_key: String },
    Renterd { bucket: String, base_url: String, worker_password: String },
    EncryptedPassthrough { source_directory: PathBuf },
    RemoteMount { relay_address: String },
}

/// Top-level configuration for the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderKind,

    /// Directory holding cached source files, named by UUID.
    pub cache_directory: PathBuf,
    /// Soft ceiling on total bytes under `cache_directory`.
    pub cache_size_limit: u64,
    /// Fraction of `cache_size_limit` above which the eviction poll starts
    /// reclaiming space (0.0-1.0).
    pub eviction_high_watermark: f64,
    /// How often the eviction poller runs.
    #[serde(with = "duration_secs")]
    pub eviction_poll_interval: Duration,

    /// Size of one chunk, in bytes, for providers with no frame-size-derived value.
    pub chunk_size: u64,
    /// Chunks to prefetch after a foreground read.
    pub read_ahead_count: u32,
    /// Chunks to prefetch behind a foreground read.
    pub read_behind_count: u32,
    /// Tail chunks prefetched on first open of a large file (`read_end`).
    pub read_end_count: u32,
    /// Idle timeout before an Open File with no handles is abandoned (0 disables).
    #[serde(with = "duration_secs")]
    pub chunk_timeout: Duration,
    /// Attempts per chunk fetch before surfacing `download_failed`.
    pub retry_read_count: u32,

    /// Backoff schedule for the upload worker: `base * attempts`, capped at `max`.
    #[serde(with = "duration_secs")]
    pub upload_retry_base_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub upload_retry_max_backoff: Duration,

    /// Concurrent in-flight provider requests.
    pub max_concurrent_requests: usize,
    /// TTL for the directory-listing cache.
    #[serde(with = "duration_secs")]
    pub directory_listing_cache_ttl: Duration,

    /// Minimum provider protocol version this build requires.
    pub required_provider_version: u32,

    /// Whether atime updates are written back on every read.
    pub access_time_tracking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::EncryptedPassthrough { source_directory: PathBuf::from(".") },
            cache_directory: std::env::temp_dir().join("repertory-cache"),
            cache_size_limit: 20 * 1024 * 1024 * 1024,
            eviction_high_watermark: 0.90,
            eviction_poll_interval: Duration::from_secs(30),
            chunk_size: 8 * 1024 * 1024,
            read_ahead_count: 4,
            read_behind_count: 0,
            read_end_count: 1,
            chunk_timeout: Duration::from_secs(30),
            retry_read_count: 6,
            upload_retry_base_backoff: Duration::from_secs(5),
            upload_retry_max_backoff: Duration::from_secs(5 * 60),
            max_concurrent_requests: 16,
            directory_listing_cache_ttl: Duration::from_secs(5),
            required_provider_version: 1,
            access_time_tracking: false,
        }
    }
}

impl Config {
    /// Parse a config from TOML text, falling back to defaults for absent fields.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Backoff for the Nth upload attempt (1-based).
    pub fn upload_backoff(&self, attempts: u32) -> Duration {
        let scaled = self.upload_retry_base_backoff.saturating_mul(attempts.max(1));
        scaled.min(self.upload_retry_max_backoff)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
