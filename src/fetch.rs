// src/fetch.rs

use crate::config::Settings;
use crate::downloader::DownloadError;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;

/// An opened response body.
pub struct FetchResponse {
    /// Value of the `Content-Length` header, if the source sent one.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, DownloadError>>,
}

/// Source of streamed file contents.
///
/// The HTTP implementation is [`HttpFetcher`]; tests plug in scripted bodies.
pub trait Fetch: Send + Sync {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchResponse, DownloadError>>;
}

/// Streaming GET over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FetchResponse, DownloadError>> {
        Box::pin(async move {
            let url = reqwest::Url::parse(url).map_err(|_| DownloadError::InvalidUrl)?;
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::HttpStatus(status.as_u16()));
            }
            let content_length = response.content_length();
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(DownloadError::from))
                .boxed();
            Ok(FetchResponse {
                content_length,
                body,
            })
        })
    }
}
