//! The cache interceptor: install, activate and fetch handlers.
//!
//! Concurrency: handlers take no locks of their own. Several fetch handlers
//! may be in flight at once, and two of them can miss the cache for the same
//! URL and both write it back. The store replaces whole entries atomically,
//! so the last write wins and no entry is ever half-written.

use std::sync::Arc;

use digidoc_net::{cache_key, Fetcher, NetError, Request, Response};
use futures::future::try_join_all;
use http::Method;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::config::CacheConfig;
use crate::{Result, ServiceWorkerError};

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Cache the assets were written to.
    pub cache_name: String,
    /// Number of assets stored.
    pub cached: usize,
    /// Activate without waiting for the previous worker to go idle.
    pub skip_waiting: bool,
}

/// Offline caching policy for one worker version.
pub struct CacheInterceptor {
    config: CacheConfig,
    offline_url: Url,
    caches: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for CacheInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInterceptor")
            .field("cache_version", &self.config.cache_version)
            .field("offline_url", &self.offline_url.as_str())
            .finish_non_exhaustive()
    }
}

impl CacheInterceptor {
    /// Create an interceptor. The config is validated up front.
    pub fn new(
        config: CacheConfig,
        caches: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let offline_url = config.offline_url()?;
        Ok(Self {
            config,
            offline_url,
            caches,
            fetcher,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Name of the cache this worker owns.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_version
    }

    pub fn caches(&self) -> &Arc<dyn CacheStore> {
        &self.caches
    }

    /// Pre-cache every static asset.
    ///
    /// All assets are fetched concurrently and written in one batch. A
    /// network failure or a non-2xx status on any of them fails the install
    /// and nothing from this attempt is stored.
    pub async fn on_install(&self) -> Result<InstallOutcome> {
        let name = self.cache_name();
        self.caches.open(name).await?;

        let urls = self.config.asset_urls()?;
        info!(cache = name, assets = urls.len(), "Caching core assets");

        let entries = try_join_all(urls.into_iter().map(|url| self.fetch_asset(url))).await?;

        let cached = entries.len();
        self.caches.put_all(name, entries).await?;
        info!(cache = name, cached, "Install complete");

        Ok(InstallOutcome {
            cache_name: name.to_string(),
            cached,
            skip_waiting: true,
        })
    }

    async fn fetch_asset(&self, url: Url) -> Result<(String, Response)> {
        let request = Request::get(url);
        let response = self.fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::AssetRejected {
                url: request.url.to_string(),
                status: response.status.as_u16(),
            });
        }
        Ok((request.cache_key(), response))
    }

    /// Delete every cache except the current version, concurrently.
    ///
    /// Returns the names that were removed.
    pub async fn on_activate(&self) -> Result<Vec<String>> {
        let current = self.cache_name();
        let stale: Vec<String> = self
            .caches
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != current)
            .collect();

        let caches = &self.caches;
        let deletions = stale.iter().map(|name| async move {
            info!(cache = %name, "Removing old cache");
            caches.delete(name).await
        });
        let removed = try_join_all(deletions).await?;

        Ok(stale
            .into_iter()
            .zip(removed)
            .filter_map(|(name, existed)| existed.then_some(name))
            .collect())
    }

    /// Answer a request from a controlled page.
    pub async fn on_fetch(&self, request: &Request) -> Result<Response> {
        if request.is_navigation() {
            self.network_first(request).await
        } else {
            self.cache_first(request).await
        }
    }

    /// Navigations: network, then the offline page. Responses are not cached.
    async fn network_first(&self, request: &Request) -> Result<Response> {
        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(response),
            Err(cause) => self.offline_fallback(request, cause).await,
        }
    }

    /// Sub-resources: cache, then network with an opportunistic write.
    async fn cache_first(&self, request: &Request) -> Result<Response> {
        let name = self.cache_name();
        // Only GET requests take part in cache matching.
        let cacheable = request.method == Method::GET;
        let key = request.cache_key();

        if cacheable {
            if let Some(hit) = self.caches.match_request(name, &key).await? {
                debug!(url = %key, "Cache hit");
                return Ok(hit);
            }
            debug!(url = %key, "Cache miss");
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if cacheable {
                    if let Err(e) = self.caches.put(name, &key, response.clone()).await {
                        warn!(url = %key, error = %e, "Failed to cache response");
                    }
                }
                Ok(response)
            }
            Err(cause) if request.accepts_html() => self.offline_fallback(request, cause).await,
            Err(cause) => Err(cause.into()),
        }
    }

    async fn offline_fallback(&self, request: &Request, cause: NetError) -> Result<Response> {
        debug!(url = %request.url, error = %cause, "Network failed, serving offline page");
        let key = cache_key(&self.offline_url);
        self.caches
            .match_request(self.cache_name(), &key)
            .await?
            .ok_or(ServiceWorkerError::OfflineFallbackMissing(key))
    }
}
