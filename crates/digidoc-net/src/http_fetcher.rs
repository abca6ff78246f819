//! Network fetches over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{Fetcher, NetError, Request, Response};

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("DigiDoc-Worker/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(Response {
            url,
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("DigiDoc-Worker/"));
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"name\":\"DigiDoc\"}"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/static/manifest.json", server.uri())).unwrap();
        let response = fetcher.fetch(&request).await.unwrap();

        assert!(response.ok());
        assert!(!response.from_cache);
        assert_eq!(response.text().unwrap(), "{\"name\":\"DigiDoc\"}");
    }

    #[tokio::test]
    async fn test_fetch_forwards_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("accept", "text/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/", server.uri()))
            .unwrap()
            .accept("text/html");
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, http::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_http_error_status_resolves() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, http::StatusCode::NOT_FOUND);
        assert_eq!(response.status_text, "Not Found");
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_connection_refused_rejects() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let fetcher = HttpFetcher::new(LoaderConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let request = Request::parse(&format!("http://127.0.0.1:{port}/")).unwrap();

        assert!(matches!(
            fetcher.fetch(&request).await,
            Err(NetError::Http(_))
        ));
    }
}
