//! In-memory `Fetch` used by unit tests to script transfers.

use crate::downloader::DownloadError;
use crate::fetch::{Fetch, FetchResponse};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct ScriptedBody {
    status: Option<u16>,
    chunks: Vec<Vec<u8>>,
    content_length: Option<Option<u64>>,
    failure: Option<String>,
    delay: Duration,
    chunk_hooks: Vec<(usize, Hook)>,
    end_hook: Option<Hook>,
}

impl ScriptedBody {
    pub fn chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            ..Self::default()
        }
    }

    /// Total of `len` bytes delivered in `count` equal chunks.
    pub fn sized(len: usize, count: usize) -> Self {
        let count = count.max(1);
        let mut chunks = vec![vec![0u8; len / count]; count];
        if let Some(last) = chunks.last_mut() {
            last.resize(len - (len / count) * (count - 1), 0);
        }
        Self::chunks(chunks)
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.content_length = Some(Some(length));
        self
    }

    pub fn without_length(mut self) -> Self {
        self.content_length = Some(None);
        self
    }

    /// Fails with a connection reset after the last scripted chunk.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Sleeps before every chunk.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Runs `hook` right before chunk `index` is handed out.
    pub fn on_chunk(mut self, index: usize, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.chunk_hooks.push((index, Arc::new(hook)));
        self
    }

    /// Runs `hook` when the body reaches its end without failing.
    pub fn on_end(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.end_hook = Some(Arc::new(hook));
        self
    }

    fn declared_length(&self) -> Option<u64> {
        match self.content_length {
            Some(length) => length,
            None if self.failure.is_some() => None,
            None => Some(self.chunks.iter().map(|c| c.len() as u64).sum()),
        }
    }
}

/// Counts bodies that are currently being read.
struct LiveGuard {
    live: Arc<AtomicUsize>,
}

impl LiveGuard {
    fn enter(live: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { live }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ScriptedFetcher {
    bodies: Mutex<HashMap<String, ScriptedBody>>,
    opened: AtomicUsize,
    live: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn insert(&self, url: &str, body: ScriptedBody) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    /// Number of `open` calls so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Highest number of bodies read at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Fetch for ScriptedFetcher {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchResponse, DownloadError>> {
        Box::pin(async move {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let body = self
                .bodies
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or(DownloadError::HttpStatus(404))?;
            if let Some(status) = body.status {
                return Err(DownloadError::HttpStatus(status));
            }

            let content_length = body.declared_length();
            let guard = LiveGuard::enter(self.live.clone(), &self.peak);
            let stream = futures_util::stream::unfold(
                (body, 0usize, guard),
                |(body, index, guard)| async move {
                    if !body.delay.is_zero() {
                        tokio::time::sleep(body.delay).await;
                    }
                    if index < body.chunks.len() {
                        for (at, hook) in &body.chunk_hooks {
                            if *at == index {
                                hook();
                            }
                        }
                        let chunk = Bytes::from(body.chunks[index].clone());
                        return Some((Ok(chunk), (body, index + 1, guard)));
                    }
                    if index > body.chunks.len() {
                        return None;
                    }
                    if let Some(message) = &body.failure {
                        let err = std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            message.clone(),
                        );
                        return Some((Err(DownloadError::Io(err)), (body, index + 1, guard)));
                    }
                    if let Some(hook) = &body.end_hook {
                        hook();
                    }
                    None
                },
            )
            .boxed();

            Ok(FetchResponse {
                content_length,
                body: stream,
            })
        })
    }
}
