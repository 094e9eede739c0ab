// HTTP access: the injected transport capability, its reqwest implementation, and the
// playlist fetcher built on top of it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::HlsConfig;
use crate::error::{HlsError, Result};

/// Streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// What a request is for. Implementations use it to pick a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Playlist,
    Key,
    Segment,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub headers: Option<&'a HeaderMap>,
    pub kind: ResourceKind,
}

impl<'a> FetchRequest<'a> {
    pub fn new(url: &'a str, kind: ResourceKind) -> Self {
        Self {
            url,
            headers: None,
            kind,
        }
    }

    pub fn with_headers(mut self, headers: Option<&'a HeaderMap>) -> Self {
        self.headers = headers;
        self
    }
}

pub struct FetchResponse {
    pub status: StatusCode,
    pub body: BodyStream,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: BodyStream) -> Self {
        Self { status, body }
    }

    /// Drain the whole body into memory. Only meant for small resources
    /// (playlists, keys).
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// HTTP GET capability used for playlists, keys and segments.
///
/// Implementations map transport faults onto [`HlsError::Connection`],
/// [`HlsError::Timeout`] and [`HlsError::Transport`]. A non-success status is not an
/// error at this level; it is returned in [`FetchResponse::status`].
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get(&self, request: FetchRequest<'_>) -> Result<FetchResponse>;
}

/// [`HttpFetcher`] backed by a shared `reqwest::Client`.
pub struct ReqwestFetcher {
    client: Client,
    request_timeout: Duration,
    segment_timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new(config: &HlsConfig) -> Result<Self> {
        let default_headers =
            build_header_map(config.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(default_headers)
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
            .pool_max_idle_per_host(config.concurrency())
            .build()
            .map_err(|e| HlsError::transport("<client>", None, e.to_string()))?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout,
            segment_timeout: config.segment_timeout,
        })
    }

    fn timeout_for(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::Playlist | ResourceKind::Key => self.request_timeout,
            ResourceKind::Segment => self.segment_timeout,
        }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get(&self, request: FetchRequest<'_>) -> Result<FetchResponse> {
        let mut builder = self
            .client
            .get(request.url)
            .timeout(self.timeout_for(request.kind));
        if let Some(headers) = request.headers {
            builder = builder.headers(headers.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HlsError::from_reqwest(request.url, e))?;

        let status = response.status();
        trace!(url = request.url, %status, version = ?response.version(), "response received");

        let url = request.url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| HlsError::from_reqwest(&url, e)))
            .boxed();

        Ok(FetchResponse::new(status, body))
    }
}

/// Build a header map from name/value pairs, rejecting malformed entries.
pub fn build_header_map<'a, I>(pairs: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| HlsError::invalid_request(name, format!("invalid header name: {e}")))?;
        let header_value = HeaderValue::from_str(value.trim()).map_err(|e| {
            HlsError::invalid_request(name, format!("invalid header value: {e}"))
        })?;
        headers.append(header_name, header_value);
    }
    Ok(headers)
}

/// Check the preconditions of a playlist request without touching the network.
///
/// The URL must be `http(s)`. A URL whose path does not end in a playlist file suffix is
/// only accepted when headers are supplied, which callers use to signal an
/// authenticated or otherwise non-standard endpoint.
pub fn validate_playlist_url(url: &str, headers: Option<&HeaderMap>) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| HlsError::invalid_request(url, e.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(HlsError::invalid_request(
            url,
            format!("unsupported scheme `{}`", parsed.scheme()),
        ));
    }

    let has_playlist_suffix = parsed.path().to_ascii_lowercase().ends_with(".m3u8");
    if !has_playlist_suffix && headers.is_none_or(HeaderMap::is_empty) {
        return Err(HlsError::invalid_request(
            url,
            "URL is not a playlist file; authentication headers are required",
        ));
    }

    Ok(parsed)
}

/// Retrieves raw playlist text.
#[derive(Clone)]
pub struct PlaylistFetcher {
    fetcher: Arc<dyn HttpFetcher>,
}

impl PlaylistFetcher {
    pub fn new(fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetch playlist text.
    ///
    /// Returns `Ok(None)` for any status other than 200. When `save_to` is set the text
    /// is appended to that file; repeated calls accumulate content.
    pub async fn fetch(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
        save_to: Option<&Path>,
    ) -> Result<Option<String>> {
        let (_, text) = self.fetch_with_status(url, headers, save_to).await?;
        Ok(text)
    }

    pub(crate) async fn fetch_with_status(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
        save_to: Option<&Path>,
    ) -> Result<(StatusCode, Option<String>)> {
        validate_playlist_url(url, headers)?;

        debug!(url, "fetching playlist");
        let response = self
            .fetcher
            .get(FetchRequest::new(url, ResourceKind::Playlist).with_headers(headers))
            .await?;

        let status = response.status;
        if status != StatusCode::OK {
            warn!(url, %status, "playlist request returned non-200 status");
            return Ok((status, None));
        }

        let text = response.text().await?;
        if let Some(path) = save_to {
            append_to_file(path, &text).await?;
            info!(path = %path.display(), "playlist saved");
        }
        Ok((status, Some(text)))
    }
}

async fn append_to_file(path: &Path, text: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
