//! # DigiDoc Net
//!
//! Request/response model and network access for the DigiDoc offline worker.
//!
//! ## Design Goals
//!
//! 1. **One fetch seam**: everything that touches the network goes through [`Fetcher`]
//! 2. **Cheap duplication**: response bodies are [`Bytes`], so a clone for the
//!    cache and a clone for the caller share one buffer
//! 3. **Browser semantics**: a fetch only fails on network-level errors; HTTP
//!    error statuses resolve normally

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod http_fetcher;
pub mod static_fetcher;

pub use http_fetcher::{HttpFetcher, LoaderConfig};
pub use static_fetcher::StaticFetcher;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    /// Same-origin sub-resource.
    #[default]
    SameOrigin,
    /// Cross-origin request with CORS.
    Cors,
    /// Opaque cross-origin request.
    NoCors,
}

/// An outgoing resource request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
}

impl Request {
    /// Create a request with an explicit method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
        }
    }

    /// Create a GET sub-resource request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a top-level navigation request.
    ///
    /// Browsers send `Accept: text/html,...` on navigations; so does this.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .accept("text/html,application/xhtml+xml,*/*;q=0.8")
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the `Accept` header. Invalid header text is ignored.
    pub fn accept(self, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(v) => self.header(ACCEPT, v),
            Err(_) => self,
        }
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this is a top-level page load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the `Accept` header asks for an HTML document.
    ///
    /// A missing or non-text header never matches.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
    }

    /// Key under which the response is cached: the URL without its fragment.
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// Cache key for a URL: fragments never take part in matching.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    /// Reason phrase, e.g. `Not Found`.
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Served from a cache rather than the network.
    pub from_cache: bool,
}

impl Response {
    /// Create a response with no headers.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Create a `200 OK` HTML response.
    pub fn html(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(url, StatusCode::OK, body).with_header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
    }

    /// Add a header, keeping any earlier values under the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Override the reason phrase.
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Body bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// The `Content-Type` header, if present and readable.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// Something that can perform network fetches.
///
/// Implementations reject only on network-level failures. A `404` or `500`
/// is a successful fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let request = Request::get(url.clone()).accept("application/javascript");

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.mode, RequestMode::SameOrigin);
        assert!(!request.is_navigation());
        assert!(!request.accepts_html());
    }

    #[test]
    fn test_navigation_request_accepts_html() {
        let request = Request::navigate(Url::parse("https://example.com/").unwrap());
        assert!(request.is_navigation());
        assert!(request.accepts_html());
    }

    #[test]
    fn test_accepts_html_without_header() {
        let request = Request::parse("https://example.com/data").unwrap();
        assert!(!request.accepts_html());
    }

    #[test]
    fn test_cache_key_drops_fragment() {
        let request = Request::parse("https://example.com/page?x=1#section").unwrap();
        assert_eq!(request.cache_key(), "https://example.com/page?x=1");
    }

    #[test]
    fn test_parse_invalid_url() {
        assert!(matches!(
            Request::parse("not a url"),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_response_clone_shares_body() {
        let url = Url::parse("https://example.com/offline.html").unwrap();
        let response = Response::html(url, "<h1>Offline</h1>");
        let copy = response.clone();

        assert!(response.ok());
        assert_eq!(copy.bytes(), response.bytes());
        assert_eq!(copy.content_type(), Some("text/html; charset=utf-8"));
        assert_eq!(response.text().unwrap(), "<h1>Offline</h1>");
    }

    #[test]
    fn test_response_status_text() {
        let url = Url::parse("https://example.com/gone").unwrap();
        let response = Response::new(url.clone(), StatusCode::NOT_FOUND, "");
        assert_eq!(response.status_text, "Not Found");

        let custom = Response::new(url.clone(), StatusCode::OK, "").with_status_text("Fine");
        assert_eq!(custom.status_text, "Fine");

        let unknown = Response::new(url, StatusCode::from_u16(599).unwrap(), "");
        assert_eq!(unknown.status_text, "");
    }
}
