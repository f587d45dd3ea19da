// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DOWNLOAD_ROOT: &str = "Roms";
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_USER_AGENT: &str = concat!("romdl/", env!("CARGO_PKG_VERSION"));

/// Settings shared by the manager and every worker of a batch.
///
/// Created once at startup and handed to the manager as `Arc<Settings>`;
/// changes go through the setters and are persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_root: PathBuf,
    pub max_concurrent: usize,
    /// Connect timeout and the longest wait for a single body chunk.
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Write buffer size for the destination file.
    pub chunk_size: usize,
    /// Minimum spacing between speed samples and progress events.
    #[serde(with = "duration_millis")]
    pub progress_interval: Duration,
    /// How long the coordinator waits on a finished worker's task.
    #[serde(with = "duration_millis")]
    pub join_timeout: Duration,
    /// Shared cap across all workers. 0 means unlimited.
    pub speed_limit_bytes_per_sec: u64,
    /// Leave `.part` files behind on failure or cancellation.
    pub keep_partial_files: bool,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_ROOT),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            speed_limit_bytes_per_sec: 0,
            keep_partial_files: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Settings {
    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.set_download_root(root);
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.set_max_concurrent(max_concurrent);
        self
    }

    /// Clamps into `MIN_CONCURRENT..=MAX_CONCURRENT`.
    pub fn set_max_concurrent(&mut self, max_concurrent: usize) {
        self.max_concurrent = clamp_concurrency(max_concurrent);
    }

    pub fn set_download_root(&mut self, root: impl Into<PathBuf>) {
        self.download_root = root.into();
    }

    pub fn set_speed_limit(&mut self, bytes_per_sec: u64) {
        self.speed_limit_bytes_per_sec = bytes_per_sec;
    }

    /// The concurrency limit a manager will actually use.
    pub fn effective_concurrency(&self) -> usize {
        clamp_concurrency(self.max_concurrent)
    }
}

fn clamp_concurrency(value: usize) -> usize {
    value.clamp(MIN_CONCURRENT, MAX_CONCURRENT)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
