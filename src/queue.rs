use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::models::{DownloadJob, JobId};

/// Called with the jobs still waiting whenever the pending queue changes.
pub type QueueCallback = Arc<dyn Fn(&[DownloadJob]) + Send + Sync>;

/// FIFO of jobs waiting for a worker slot.
///
/// Jobs only ever leave from the front and are never reordered or put back.
#[derive(Default)]
pub struct PendingQueue {
    jobs: VecDeque<(JobId, DownloadJob)>,
    on_changed: Option<QueueCallback>,
}

impl fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQueue")
            .field("jobs", &self.jobs)
            .field("on_changed", &self.on_changed.is_some())
            .finish()
    }
}

impl PendingQueue {
    pub fn new(jobs: impl IntoIterator<Item = (JobId, DownloadJob)>) -> Self {
        Self {
            jobs: jobs.into_iter().collect(),
            on_changed: None,
        }
    }

    pub fn set_callback(&mut self, callback: QueueCallback) {
        self.on_changed = Some(callback);
    }

    /// Takes the oldest job and notifies the callback.
    pub fn pop_front(&mut self) -> Option<(JobId, DownloadJob)> {
        let next = self.jobs.pop_front();
        if next.is_some() {
            self.notify();
        }
        next
    }

    /// Drops every waiting job, returning how many there were. The callback
    /// fires even when the queue was already empty so the UI can reset.
    pub fn clear(&mut self) -> usize {
        let dropped = self.jobs.len();
        self.jobs.clear();
        self.notify();
        dropped
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DownloadJob> {
        self.jobs.iter().map(|(_, job)| job.clone()).collect()
    }

    fn notify(&self) {
        if let Some(callback) = &self.on_changed {
            callback(&self.snapshot());
        }
    }
}
