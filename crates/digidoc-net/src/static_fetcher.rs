//! In-memory fetcher for offline simulation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::StatusCode;
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

use crate::{cache_key, Fetcher, NetError, Request, Response};

/// A [`Fetcher`] that answers from a fixed route table.
///
/// Unknown URLs resolve to `404 Not Found`. Switching the fetcher offline, or
/// marking a single URL as unreachable, makes fetches reject the way a
/// dropped connection would.
#[derive(Debug)]
pub struct StaticFetcher {
    routes: RwLock<HashMap<String, Response>>,
    unreachable: RwLock<HashSet<String>>,
    online: AtomicBool,
    calls: AtomicUsize,
}

impl StaticFetcher {
    /// Create an online fetcher with no routes.
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Serve `body` with `200 OK` for `url`.
    pub async fn route(&self, url: &Url, body: impl Into<Bytes>) {
        self.route_response(Response::new(url.clone(), StatusCode::OK, body))
            .await;
    }

    /// Serve a prepared response for its URL.
    pub async fn route_response(&self, response: Response) {
        self.routes
            .write()
            .await
            .insert(cache_key(&response.url), response);
    }

    /// Make fetches of `url` reject even while online.
    pub async fn set_unreachable(&self, url: &Url) {
        self.unreachable.write().await.insert(cache_key(url));
    }

    /// Toggle network availability.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Whether the simulated network is up.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of fetches attempted so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StaticFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = request.cache_key();
        trace!(url = %key, "Static fetch");

        if !self.is_online() {
            return Err(NetError::Offline(key));
        }
        if self.unreachable.read().await.contains(&key) {
            return Err(NetError::Offline(key));
        }

        let response = match self.routes.read().await.get(&key) {
            Some(response) => response.clone(),
            None => Response::new(request.url.clone(), StatusCode::NOT_FOUND, Bytes::new()),
        };
        Ok(response)
    }
}
