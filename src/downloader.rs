use crate::archive::{self, ArchiveError};
use crate::config::Settings;
use crate::fetch::Fetch;
use crate::limiter::SpeedLimiter;
use crate::models::{temporary_path, DownloadJob, JobId, JobProgress, WorkerEvent};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url")]
    InvalidUrl,
    #[error("group key {0:?} does not name a folder under the download root")]
    InvalidDestination(String),
    #[error("server responded with HTTP {0}")]
    HttpStatus(u16),
    #[error("no data received within {0:?}")]
    Timeout(Duration),
    #[error("connection closed after {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },
    #[error("download cancelled")]
    Cancelled,
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
}

/// Transfers exactly one job to local storage.
///
/// The worker only talks to the outside through its event sender; the last
/// event it sends is always `WorkerEvent::Finished`.
pub struct DownloadWorker {
    id: JobId,
    job: DownloadJob,
    settings: Arc<Settings>,
    fetcher: Arc<dyn Fetch>,
    limiter: SpeedLimiter,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl DownloadWorker {
    pub fn new(
        id: JobId,
        job: DownloadJob,
        settings: Arc<Settings>,
        fetcher: Arc<dyn Fetch>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            job,
            settings,
            fetcher,
            limiter: SpeedLimiter::unlimited(),
            cancel: CancellationToken::new(),
            events,
        }
    }

    /// Replaces the worker's own token, e.g. with a child of a batch token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_limiter(mut self, limiter: SpeedLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a cooperative stop. Idempotent, never blocks.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Runs the transfer to completion. Never fails: every error becomes a
    /// log event followed by `Finished { local_file: None }`.
    pub async fn run(self) {
        let display = self.job.file_name().unwrap_or_else(|| self.job.name.clone());

        let local_file = match self.download().await {
            Ok(path) => {
                self.log(format!("Download completed: {display}"));
                self.post_process(path).await
            }
            Err(DownloadError::Cancelled) => {
                self.log(format!("Download cancelled: {display}"));
                None
            }
            Err(e) => {
                warn!(job = %self.id, name = %self.job.name, error = %e, "download failed");
                self.send(WorkerEvent::Log {
                    id: self.id,
                    message: format!("Error downloading {display}: {e}"),
                });
                None
            }
        };

        self.send(WorkerEvent::Finished {
            id: self.id,
            local_file,
        });
    }

    async fn download(&self) -> Result<PathBuf, DownloadError> {
        let destination_dir = self
            .job
            .destination_dir(&self.settings.download_root)
            .ok_or_else(|| DownloadError::InvalidDestination(self.job.group_key.clone()))?;
        let destination = self
            .job
            .file_name()
            .map(|name| destination_dir.join(name))
            .ok_or(DownloadError::InvalidUrl)?;
        tokio::fs::create_dir_all(&destination_dir).await?;

        self.log(format!(
            "Starting download: {} into {}",
            self.job.name,
            destination_dir.display()
        ));

        let temp_path = temporary_path(&destination);
        let result = match self.transfer(&temp_path).await {
            Ok(()) => tokio::fs::rename(&temp_path, &destination)
                .await
                .map_err(DownloadError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(destination),
            Err(e) => {
                if self.settings.keep_partial_files {
                    debug!(path = %temp_path.display(), "keeping partial file");
                } else if tokio::fs::remove_file(&temp_path).await.is_ok() {
                    debug!(path = %temp_path.display(), "removed partial file");
                }
                Err(e)
            }
        }
    }

    async fn transfer(&self, temp_path: &Path) -> Result<(), DownloadError> {
        let timeout = self.settings.request_timeout;

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            opened = tokio::time::timeout(timeout, self.fetcher.open(&self.job.url)) => {
                opened.map_err(|_| DownloadError::Timeout(timeout))??
            }
        };

        let expected = self.job.expected_size_bytes;
        let total = match response.content_length {
            Some(length) if length > 0 => {
                if expected > 0 && length != expected {
                    debug!(job = %self.id, expected, length, "content-length differs from catalog size");
                }
                length
            }
            _ => expected,
        };

        let file = tokio::fs::File::create(temp_path).await?;
        let mut writer = BufWriter::with_capacity(self.settings.chunk_size.max(1), file);

        // Whatever arrived reaches the `.part` file, also when streaming stops early.
        let streamed = self.stream_body(&mut writer, response.body, total).await;
        let flushed = writer.flush().await;
        let (downloaded, elapsed) = streamed?;
        flushed?;

        if let Some(length) = response.content_length {
            if downloaded < length {
                return Err(DownloadError::Incomplete {
                    expected: length,
                    received: downloaded,
                });
            }
        }

        let elapsed = elapsed.as_secs_f64();
        let average_speed = if elapsed > 0.0 {
            downloaded as f64 / elapsed
        } else {
            0.0
        };
        self.send(WorkerEvent::Progress(JobProgress::new(
            self.id,
            self.job.name.clone(),
            downloaded,
            downloaded,
            average_speed,
        )));
        Ok(())
    }

    /// Copies the body into `writer`, sampling speed at most once per
    /// progress interval. Returns the byte count and the time it took.
    async fn stream_body(
        &self,
        writer: &mut BufWriter<tokio::fs::File>,
        mut body: BoxStream<'static, Result<Bytes, DownloadError>>,
        total: u64,
    ) -> Result<(u64, Duration), DownloadError> {
        let timeout = self.settings.request_timeout;
        let started = Instant::now();
        let mut downloaded: u64 = 0;
        let mut sample_at = started;
        let mut sample_bytes: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = tokio::time::timeout(timeout, body.next()) => {
                    next.map_err(|_| DownloadError::Timeout(timeout))?
                }
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            self.limiter.take(chunk.len() as u64).await;
            writer.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let now = Instant::now();
            let since_sample = now.duration_since(sample_at);
            if since_sample >= self.settings.progress_interval && !since_sample.is_zero() {
                let speed = (downloaded - sample_bytes) as f64 / since_sample.as_secs_f64();
                sample_at = now;
                sample_bytes = downloaded;
                self.send(WorkerEvent::Progress(JobProgress::new(
                    self.id,
                    self.job.name.clone(),
                    downloaded,
                    total,
                    speed,
                )));
            }
        }

        Ok((downloaded, started.elapsed()))
    }

    /// Unpacks `.zip` downloads next to the archive. An extraction failure
    /// still counts as success and reports the archive itself.
    async fn post_process(&self, path: PathBuf) -> Option<PathBuf> {
        if !archive::is_archive(&path) {
            return Some(path);
        }
        let Some(into) = path.parent().map(Path::to_path_buf) else {
            return Some(path);
        };

        let archive_path = path.clone();
        let extracted =
            tokio::task::spawn_blocking(move || archive::extract_zip(&archive_path, &into)).await;

        match extracted {
            Ok(Ok(Some(first))) => {
                self.log(format!("Extracted {}", first.display()));
                Some(first)
            }
            Ok(Ok(None)) => {
                self.log(format!("Archive {} contained no files", path.display()));
                None
            }
            Ok(Err(e)) => {
                let e = DownloadError::from(e);
                self.log(format!("Extraction of {} failed: {e}", path.display()));
                Some(path)
            }
            Err(e) => {
                self.log(format!("Extraction of {} aborted: {e}", path.display()));
                Some(path)
            }
        }
    }

    fn log(&self, message: String) {
        info!(job = %self.id, "{message}");
        self.send(WorkerEvent::Log {
            id: self.id,
            message,
        });
    }

    fn send(&self, event: WorkerEvent) {
        // A dropped receiver means the batch is gone; nothing left to report to.
        let _ = self.events.send(event);
    }
}
