// src/manager.rs

use crate::config::Settings;
use crate::downloader::DownloadWorker;
use crate::fetch::Fetch;
use crate::limiter::SpeedLimiter;
use crate::models::{DownloadJob, JobId, JobProgress, ManagerEvent, WorkerEvent};
use crate::queue::{PendingQueue, QueueCallback};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("process_queue was already called for this batch")]
    AlreadyStarted,
}

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Running,
    Cancelling,
    Finished,
}

/// A job that produced a local file.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub id: JobId,
    pub job: DownloadJob,
    pub local_file: PathBuf,
}

/// What a finished batch delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub completed: Vec<CompletedJob>,
    /// Names of jobs that failed or were cancelled after admission.
    pub failed: Vec<String>,
    /// Names of jobs dropped from the queue by `cancel_all` before they started.
    pub dropped: Vec<String>,
    pub cancelled: bool,
}

/// Cloneable handle for stopping a batch from outside the coordinating task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Stops admission as soon as this returns and tells running workers to
    /// stop at their next chunk. Idempotent.
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct ActiveWorker {
    job: DownloadJob,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    last_progress: Option<JobProgress>,
}

enum Step {
    Cancel,
    Worker(Option<WorkerEvent>),
}

/// Bounded-concurrency scheduler over a fixed list of jobs.
///
/// All state below is owned by the `process_queue` future. Workers run on
/// their own tasks and only reach the manager through the worker mailbox.
pub struct DownloadManager {
    settings: Arc<Settings>,
    fetcher: Arc<dyn Fetch>,
    limiter: SpeedLimiter,
    max_concurrent: usize,
    queue: PendingQueue,
    active: HashMap<JobId, ActiveWorker>,
    downloaded_bytes: HashMap<JobId, u64>,
    /// Sum of catalog sizes over the original batch; never shrinks.
    total_bytes: u64,
    cancel: CancellationToken,
    cancelled: bool,
    started: bool,
    state: ManagerState,
    all_finished_sent: bool,
    peak_active: usize,
    report: BatchReport,
    events: mpsc::UnboundedSender<ManagerEvent>,
    worker_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl DownloadManager {
    /// Creates a manager for one batch. Job ids are assigned in list order.
    pub fn new(
        jobs: Vec<DownloadJob>,
        settings: Arc<Settings>,
        fetcher: Arc<dyn Fetch>,
    ) -> (Self, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let numbered: Vec<(JobId, DownloadJob)> = jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| (JobId(index as u64 + 1), job))
            .collect();
        let total_bytes = numbered.iter().map(|(_, job)| job.expected_size_bytes).sum();
        let downloaded_bytes = numbered.iter().map(|(id, _)| (*id, 0)).collect();

        let manager = Self {
            limiter: SpeedLimiter::new(settings.speed_limit_bytes_per_sec),
            max_concurrent: settings.effective_concurrency(),
            settings,
            fetcher,
            queue: PendingQueue::new(numbered),
            active: HashMap::new(),
            downloaded_bytes,
            total_bytes,
            cancel: CancellationToken::new(),
            cancelled: false,
            started: false,
            state: ManagerState::Created,
            all_finished_sent: false,
            peak_active: 0,
            report: BatchReport::default(),
            events,
            worker_tx,
            worker_rx,
        };
        (manager, events_rx)
    }

    /// Registers the callback fired whenever the waiting list changes.
    pub fn with_queue_callback(
        mut self,
        callback: impl Fn(&[DownloadJob]) + Send + Sync + 'static,
    ) -> Self {
        let callback: QueueCallback = Arc::new(callback);
        self.queue.set_callback(callback);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Highest number of workers that were running at the same time.
    pub fn peak_active(&self) -> usize {
        self.peak_active
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Runs the batch until every job has left the queue and every worker
    /// has finished. May only be called once.
    pub async fn process_queue(&mut self) -> Result<BatchReport, ManagerError> {
        if self.started {
            return Err(ManagerError::AlreadyStarted);
        }
        self.started = true;
        if self.state == ManagerState::Finished {
            // cancel_all already drained the batch on the coordinating context.
            return Ok(std::mem::take(&mut self.report));
        }
        self.state = ManagerState::Running;
        self.log("Download manager started.".to_string());
        info!(
            jobs = self.queue.len(),
            max_concurrent = self.max_concurrent,
            total_bytes = self.total_bytes,
            "batch started"
        );

        self.admit();
        self.finish_if_drained();

        let cancel = self.cancel.clone();
        while self.state != ManagerState::Finished {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.cancelled => Step::Cancel,
                event = self.worker_rx.recv() => Step::Worker(event),
            };
            match step {
                Step::Cancel => self.on_cancel_requested(),
                Step::Worker(Some(event)) => self.on_worker_event(event).await,
                // The manager holds a sender, so this only happens if it is torn down.
                Step::Worker(None) => break,
            }
        }

        Ok(std::mem::take(&mut self.report))
    }

    /// Cancels the batch from the coordinating context: no further admission,
    /// the waiting list is emptied right away and running workers are told
    /// to stop. Idempotent.
    pub fn cancel_all(&mut self) {
        self.cancel.cancel();
        self.on_cancel_requested();
    }

    fn admit(&mut self) {
        while !self.cancel.is_cancelled() && self.active.len() < self.max_concurrent {
            let Some((id, job)) = self.queue.pop_front() else {
                break;
            };
            self.spawn_worker(id, job);
        }
        debug_assert!(self.active.len() <= self.max_concurrent);
    }

    fn spawn_worker(&mut self, id: JobId, job: DownloadJob) {
        self.log(format!("Starting download for: {}", job.name));
        let cancel = self.cancel.child_token();
        let worker = DownloadWorker::new(
            id,
            job.clone(),
            self.settings.clone(),
            self.fetcher.clone(),
            self.worker_tx.clone(),
        )
        .with_cancel_token(cancel.clone())
        .with_limiter(self.limiter.clone());

        let handle = tokio::spawn(worker.run());
        self.active.insert(
            id,
            ActiveWorker {
                job,
                cancel,
                handle,
                last_progress: None,
            },
        );
        self.peak_active = self.peak_active.max(self.active.len());
        debug!(job = %id, active = self.active.len(), pending = self.queue.len(), "admitted");
    }

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Log { message, .. } => self.emit(ManagerEvent::Log(message)),
            WorkerEvent::Progress(progress) => self.on_worker_progress(progress),
            WorkerEvent::Finished { id, local_file } => {
                self.on_worker_finished(id, local_file).await
            }
        }
    }

    fn on_worker_progress(&mut self, progress: JobProgress) {
        let Some(active) = self.active.get_mut(&progress.id) else {
            debug!(job = %progress.id, "progress from a worker that already finished");
            return;
        };
        active.last_progress = Some(progress.clone());
        self.downloaded_bytes
            .insert(progress.id, progress.downloaded_bytes);

        self.emit(ManagerEvent::JobProgress(progress));
        let percent = self.aggregate_percent();
        self.emit(ManagerEvent::AggregateProgress(percent));
    }

    async fn on_worker_finished(&mut self, id: JobId, local_file: Option<PathBuf>) {
        let Some(active) = self.active.remove(&id) else {
            warn!(job = %id, "finish reported for an unknown worker");
            return;
        };
        let ActiveWorker {
            job,
            cancel,
            mut handle,
            last_progress,
        } = active;

        match tokio::time::timeout(self.settings.join_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(job = %id, error = %e, "worker task ended abnormally");
                self.log(format!("Worker for {} ended abnormally: {e}", job.name));
            }
            Err(_) => {
                cancel.cancel();
                handle.abort();
                warn!(job = %id, timeout = ?self.settings.join_timeout, "worker did not stop in time");
                self.log(format!(
                    "Worker for {} did not stop within {:?}",
                    job.name, self.settings.join_timeout
                ));
            }
        }

        match &local_file {
            Some(path) => {
                let transferred = last_progress
                    .as_ref()
                    .map(|p| p.downloaded_bytes.max(p.total_bytes))
                    .unwrap_or(job.expected_size_bytes);
                let speed = last_progress
                    .as_ref()
                    .map(|p| p.speed_bytes_per_sec)
                    .unwrap_or(0.0);
                self.emit(ManagerEvent::JobProgress(JobProgress::new(
                    id,
                    job.name.clone(),
                    transferred,
                    transferred,
                    speed,
                )));
                info!(job = %id, path = %path.display(), "download finished");
                self.report.completed.push(CompletedJob {
                    id,
                    job: job.clone(),
                    local_file: path.clone(),
                });
            }
            None => {
                info!(job = %id, name = %job.name, "download did not produce a file");
                self.report.failed.push(job.name.clone());
            }
        }

        self.emit(ManagerEvent::FileFinished {
            id,
            name: job.name.clone(),
            local_file,
        });
        self.emit(ManagerEvent::JobFinished { id, name: job.name });

        self.admit();
        self.finish_if_drained();
    }

    fn on_cancel_requested(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.report.cancelled = true;
        self.log("Cancelling all downloads...".to_string());

        for active in self.active.values() {
            active.cancel.cancel();
        }

        let dropped = self.queue.snapshot();
        self.queue.clear();
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "dropped queued jobs");
        }
        self.report
            .dropped
            .extend(dropped.into_iter().map(|job| job.name));

        if !self.active.is_empty() && self.state != ManagerState::Finished {
            self.state = ManagerState::Cancelling;
        }
        self.finish_if_drained();
    }

    /// Emits `AllFinished` the first time both the queue and the active set are empty.
    fn finish_if_drained(&mut self) {
        if self.all_finished_sent || !self.queue.is_empty() || !self.active.is_empty() {
            return;
        }
        if self.cancelled {
            self.log("Downloads cancelled.".to_string());
        } else {
            self.log("All downloads completed.".to_string());
        }
        info!(
            completed = self.report.completed.len(),
            failed = self.report.failed.len(),
            cancelled = self.cancelled,
            "batch finished"
        );
        self.all_finished_sent = true;
        self.state = ManagerState::Finished;
        self.emit(ManagerEvent::AllFinished);
    }

    fn aggregate_percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let downloaded: u64 = self.downloaded_bytes.values().sum();
        let ratio = downloaded as f64 / self.total_bytes as f64;
        (ratio * 100.0).min(100.0) as u8
    }

    fn log(&self, message: String) {
        debug!("{message}");
        self.emit(ManagerEvent::Log(message));
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        // Workers must not outlive their batch.
        for active in self.active.values() {
            active.cancel.cancel();
            active.handle.abort();
        }
    }
}
