// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Folder used when a job carries no group key.
pub const DEFAULT_GROUP: &str = "default";

/// Opaque identifier the manager assigns to every job of a batch.
///
/// Display names are not guaranteed unique, so progress and completion are
/// correlated by this id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable description of one file to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub name: String,
    pub url: String,
    /// Destination grouping key, e.g. the console a ROM belongs to.
    #[serde(default)]
    pub group_key: String,
    /// Size hint from the catalog listing. `0` means unknown.
    #[serde(default)]
    pub expected_size_bytes: u64,
}

impl DownloadJob {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        group_key: impl Into<String>,
        expected_size_bytes: u64,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            group_key: group_key.into(),
            expected_size_bytes,
        }
    }

    /// The per-group folder under `download_root` this job writes into.
    ///
    /// Returns `None` for group keys that are absolute or step outside the
    /// root (`..`, `.`, drive prefixes).
    pub fn destination_dir(&self, download_root: &Path) -> Option<PathBuf> {
        let group = self.group_key.trim();
        if group.is_empty() {
            return Some(download_root.join(DEFAULT_GROUP));
        }
        let relative = Path::new(group)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        relative.then(|| download_root.join(group))
    }

    /// Percent-decoded last path segment of the URL.
    ///
    /// Returns `None` when the URL does not parse or the segment could escape
    /// the destination directory.
    pub fn file_name(&self) -> Option<String> {
        let url = reqwest::Url::parse(&self.url).ok()?;
        let segment = url.path_segments()?.last()?;
        let decoded = urlencoding::decode(segment).ok()?.into_owned();
        if decoded.is_empty()
            || decoded == "."
            || decoded == ".."
            || decoded.contains('/')
            || decoded.contains('\\')
        {
            return None;
        }
        Some(decoded)
    }

    /// `<download_root>/<group_key>/<file_name>`.
    pub fn destination(&self, download_root: &Path) -> Option<PathBuf> {
        let dir = self.destination_dir(download_root)?;
        self.file_name().map(|name| dir.join(name))
    }
}

/// Returns the path the worker streams into before the final rename.
/// e.g., for "/path/to/game.zip", it returns "/path/to/game.zip.part"
pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// A snapshot of one job's transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub id: JobId,
    pub name: String,
    pub downloaded_bytes: u64,
    /// Known total. `0` when neither the catalog nor the server reported one.
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    /// Remaining seconds, `None` when the speed or the total is unknown.
    pub eta_seconds: Option<f64>,
}

impl JobProgress {
    pub fn new(id: JobId, name: impl Into<String>, downloaded: u64, total: u64, speed: f64) -> Self {
        let eta_seconds = if speed > 0.0 && total > 0 {
            Some(total.saturating_sub(downloaded) as f64 / speed)
        } else {
            None
        };
        Self {
            id,
            name: name.into(),
            downloaded_bytes: downloaded,
            total_bytes: total,
            speed_bytes_per_sec: speed,
            eta_seconds,
        }
    }

    /// Whole percent in `0..=100`; `0` when the total is unknown.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let ratio = self.downloaded_bytes as f64 / self.total_bytes as f64;
        (ratio * 100.0).min(100.0) as u8
    }
}

/// Messages a worker sends to the coordinating task.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Log { id: JobId, message: String },
    Progress(JobProgress),
    /// Terminal. `None` means failure or cancellation.
    Finished { id: JobId, local_file: Option<PathBuf> },
}

/// Events the manager publishes to its consumer (UI, CLI, logging).
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// Human-readable status line.
    Log(String),
    JobProgress(JobProgress),
    /// Whole-batch completion estimate, 0–100.
    AggregateProgress(u8),
    /// Resolved local file of a job, `None` when it failed or was cancelled.
    FileFinished {
        id: JobId,
        name: String,
        local_file: Option<PathBuf>,
    },
    JobFinished { id: JobId, name: String },
    AllFinished,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(url: &str, group: &str) -> DownloadJob {
        DownloadJob::new("Game", url, group, 0)
    }

    #[test]
    fn destination_uses_group_and_decoded_basename() {
        let job = job(
            "https://example.org/files/No-Intro/Game%20Boy/Tetris%20(World).zip",
            "gb",
        );
        let dest = job.destination(Path::new("Roms")).unwrap();
        assert_eq!(dest, Path::new("Roms").join("gb").join("Tetris (World).zip"));
    }

    #[test]
    fn empty_group_falls_back_to_default_folder() {
        let job = job("https://example.org/a.gba", "  ");
        assert_eq!(
            job.destination_dir(Path::new("/tmp/roms")),
            Some(Path::new("/tmp/roms").join(DEFAULT_GROUP))
        );
    }

    #[test]
    fn group_key_cannot_leave_the_download_root() {
        let root = Path::new("/data/Roms");
        for group in ["/tmp/evil", "../../etc", "gb/../..", "./gb"] {
            let job = job("https://h/a.gb", group);
            assert_eq!(job.destination_dir(root), None, "group {group:?}");
            assert_eq!(job.destination(root), None, "group {group:?}");
        }

        let nested = job("https://h/a.gb", "Nintendo/Game Boy");
        assert_eq!(
            nested.destination(root),
            Some(root.join("Nintendo").join("Game Boy").join("a.gb"))
        );
    }

    #[test]
    fn rejects_urls_without_a_usable_file_name() {
        assert_eq!(job("https://example.org/dir/", "gb").file_name(), None);
        assert_eq!(job("not a url", "gb").file_name(), None);
        assert_eq!(job("https://example.org/a%2F..%2Fb", "gb").file_name(), None);
    }

    #[test]
    fn temporary_path_appends_part_suffix() {
        assert_eq!(
            temporary_path(Path::new("/r/gb/game.zip")),
            PathBuf::from("/r/gb/game.zip.part")
        );
    }

    #[test]
    fn progress_eta_and_percent() {
        let progress = JobProgress::new(JobId(1), "Game", 50, 100, 10.0);
        assert_eq!(progress.eta_seconds, Some(5.0));
        assert_eq!(progress.percent(), 50);

        let unknown = JobProgress::new(JobId(1), "Game", 50, 0, 10.0);
        assert_eq!(unknown.eta_seconds, None);
        assert_eq!(unknown.percent(), 0);

        let stalled = JobProgress::new(JobId(1), "Game", 50, 100, 0.0);
        assert_eq!(stalled.eta_seconds, None);
    }

    #[test]
    fn job_deserializes_with_optional_fields() {
        let job: DownloadJob =
            serde_json::from_str(r#"{"name":"Tetris","url":"https://x/t.gb"}"#).unwrap();
        assert_eq!(job.group_key, "");
        assert_eq!(job.expected_size_bytes, 0);
    }
}
