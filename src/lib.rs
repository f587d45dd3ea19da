pub mod archive;
pub mod config;
pub mod downloader;
pub mod fetch;
pub mod format;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod queue;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

/// Convenient re-exports of the types a batch caller needs.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::downloader::{DownloadError, DownloadWorker};
    pub use crate::fetch::{Fetch, FetchResponse, HttpFetcher};
    pub use crate::manager::{
        BatchReport, CancelHandle, CompletedJob, DownloadManager, ManagerError, ManagerState,
    };
    pub use crate::models::{DownloadJob, JobId, JobProgress, ManagerEvent};
    pub use crate::store::{CompletedDownload, StateStore};
}
