//! # Flashcache Net
//!
//! Request and response model shared by the offline worker, plus the
//! [`Fetcher`] seam through which every network call goes.
//!
//! ## Design Goals
//!
//! 1. **Cheap clones**: bodies are `Bytes`, so a response can be handed to the
//!    caller and written to a store without copying.
//! 2. **Pluggable network**: strategies only see `dyn Fetcher`; production uses
//!    [`HttpFetcher`], tests use the in-memory fetcher behind the `mock` feature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flashcache_common::{with_timeout, OfflineError};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

mod http_fetcher;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use http_fetcher::{HttpFetcher, LoaderConfig};

/// Errors that can occur while fetching.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected status {status} for {url}")]
    Status { url: Url, status: StatusCode },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<NetError> for OfflineError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout(limit) => OfflineError::Timeout(limit),
            other => OfflineError::network_with_source("fetch failed", other),
        }
    }
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Subresource from the same origin.
    #[default]
    SameOrigin,
    /// Cross-origin subresource with CORS.
    Cors,
    /// Opaque cross-origin subresource.
    NoCors,
}

/// An intercepted or outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::SameOrigin,
        }
    }

    /// Create a page navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse a URL and build a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this is a page navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    /// Built locally, e.g. the 503 fallback.
    Synthetic,
}

/// A response returned to the page or stored in a cache.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl Response {
    /// A network response with the given status and body.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    /// The empty-bodied 503 handed out when the network is gone and
    /// nothing cached can stand in.
    pub fn service_unavailable() -> Self {
        Self {
            source: ResponseSource::Synthetic,
            ..Self::new(StatusCode::SERVICE_UNAVAILABLE, Bytes::new())
        }
    }

    /// Check if the response is successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Mark the response's origin.
    pub fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }
}

/// Performs network requests on behalf of the worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a request. Non-2xx statuses are returned as responses, not errors;
    /// `Err` means the network itself failed.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        (**self).fetch(request).await
    }
}

/// Wraps a fetcher so a hung request becomes [`NetError::Timeout`].
#[derive(Debug, Clone)]
pub struct TimeoutFetcher<F> {
    inner: F,
    limit: Duration,
}

impl<F: Fetcher> TimeoutFetcher<F> {
    pub fn new(inner: F, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl<F: Fetcher> Fetcher for TimeoutFetcher<F> {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        match with_timeout(self.limit, self.inner.fetch(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(url = %request.url, limit = ?self.limit, "Fetch timed out");
                Err(NetError::Timeout(self.limit))
            }
        }
    }
}
