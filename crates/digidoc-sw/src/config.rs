//! Worker configuration.

use std::path::Path;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Configuration for a [`CacheInterceptor`](crate::CacheInterceptor).
///
/// Bumping `cache_version` is the only way to force clients onto fresh
/// assets: the next activation deletes every cache with another name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Name of the current cache generation.
    pub cache_version: String,

    /// Assets that must be cached before the worker is ready.
    pub static_assets: Vec<String>,

    /// Page served when the network is unavailable.
    pub offline_fallback_url: String,

    /// Base URL relative asset paths resolve against.
    pub scope: Url,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_version: "digidoc-cache-v2".to_string(),
            static_assets: vec![
                "/".to_string(),
                "/static/manifest.json".to_string(),
                "/static/service-worker.js".to_string(),
                "/static/icons/icon-192x192.png".to_string(),
                "/static/icons/icon-512x512.png".to_string(),
                "/static/offline.html".to_string(),
            ],
            offline_fallback_url: "/static/offline.html".to_string(),
            scope: Url::parse("http://localhost:8501/").expect("static scope URL"),
        }
    }
}

impl CacheConfig {
    /// Create a config with no pre-cached assets.
    pub fn new(
        cache_version: impl Into<String>,
        offline_fallback_url: impl Into<String>,
        scope: Url,
    ) -> Self {
        Self {
            cache_version: cache_version.into(),
            static_assets: Vec::new(),
            offline_fallback_url: offline_fallback_url.into(),
            scope,
        }
    }

    /// Append a static asset.
    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.static_assets.push(asset.into());
        self
    }

    /// Parse a JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServiceWorkerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ServiceWorkerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Check that every URL resolves, no asset is listed twice and the
    /// version is usable.
    ///
    /// An offline page missing from `static_assets` is allowed but logged:
    /// fallbacks will then only work once something else cached it.
    pub fn validate(&self) -> Result<()> {
        if self.cache_version.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache version must not be empty".to_string(),
            ));
        }

        let assets = self.asset_urls()?;
        let offline = self.offline_url()?;

        let mut seen = HashSet::with_capacity(assets.len());
        for asset in &assets {
            let key = digidoc_net::cache_key(asset);
            if !seen.insert(key.clone()) {
                return Err(ServiceWorkerError::Config(format!(
                    "static asset listed more than once: {key}"
                )));
            }
        }

        let precached = assets
            .iter()
            .any(|u| digidoc_net::cache_key(u) == digidoc_net::cache_key(&offline));
        if !precached {
            warn!(offline_url = %offline, "Offline fallback page is not pre-cached");
        }
        Ok(())
    }

    /// Resolve a possibly relative path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.scope
            .join(path)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid URL {path:?}: {e}")))
    }

    /// Absolute URLs of every static asset, in list order.
    pub fn asset_urls(&self) -> Result<Vec<Url>> {
        self.static_assets.iter().map(|a| self.resolve(a)).collect()
    }

    /// Absolute URL of the offline fallback page.
    pub fn offline_url(&self) -> Result<Url> {
        self.resolve(&self.offline_fallback_url)
    }
}
