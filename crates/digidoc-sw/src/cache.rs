//! Named caches of request/response pairs.
//!
//! [`CacheStore`] is the storage seam the interceptor talks to. Every
//! single-key operation replaces a whole entry atomically, so concurrent
//! writers for one URL resolve as last-write-wins without corrupting the
//! entry.

use async_trait::async_trait;
use bytes::Bytes;
use digidoc_common::now_millis;
use digidoc_net::Response;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::trace;
use url::Url;

// ==================== Errors ====================

/// Errors raised by cache storage.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Corrupt entry for {url}: {reason}")]
    CorruptEntry { url: String, reason: String },
}

// ==================== Cache Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (cache key).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Reason phrase sent with the status.
    #[serde(default)]
    pub status_text: String,

    /// Response headers in wire order, lower-cased names. A name appears
    /// once per value.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response under `key`.
    ///
    /// Headers that are not valid UTF-8 are dropped.
    pub fn from_response(key: &str, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.to_string(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            status_text: response.status_text.clone(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let corrupt = |reason: String| CacheError::CorruptEntry {
            url: self.url.clone(),
            reason,
        };

        let url = Url::parse(&self.url).map_err(|e| corrupt(e.to_string()))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| corrupt(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| corrupt(e.to_string()))?;
            let value = HeaderValue::from_str(value).map_err(|e| corrupt(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status,
            status_text: self.status_text.clone(),
            headers,
            body: Bytes::from(self.body.clone()),
            from_cache: true,
        })
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A cache instance.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Add or replace an entry.
    pub fn put(&mut self, url: &str, entry: CacheEntry) {
        self.entries.insert(url.to_string(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// Get all keys (URLs), sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Store ====================

/// Storage for named caches.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// All cache names, sorted.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// Look up `key` in the named cache. A missing cache is a miss.
    async fn match_request(&self, name: &str, key: &str) -> Result<Option<Response>, CacheError>;

    /// Store one response, replacing any previous entry. Opens the cache if needed.
    async fn put(&self, name: &str, key: &str, response: Response) -> Result<(), CacheError>;

    /// Store a batch of responses in one step; either all land or none do.
    async fn put_all(&self, name: &str, entries: Vec<(String, Response)>) -> Result<(), CacheError>;

    /// Keys of the named cache, sorted.
    async fn entries(&self, name: &str) -> Result<Vec<String>, CacheError>;
}

/// In-memory cache storage.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort_unstable();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn match_request(&self, name: &str, key: &str) -> Result<Option<Response>, CacheError> {
        let caches = self.caches.read().await;
        caches
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .map(CacheEntry::to_response)
            .transpose()
    }

    async fn put(&self, name: &str, key: &str, response: Response) -> Result<(), CacheError> {
        trace!(cache = name, url = key, "Cache put");
        let entry = CacheEntry::from_response(key, &response);
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
            .put(key, entry);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<(String, Response)>) -> Result<(), CacheError> {
        let prepared: Vec<CacheEntry> = entries
            .iter()
            .map(|(key, response)| CacheEntry::from_response(key, response))
            .collect();

        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for entry in prepared {
            let key = entry.url.clone();
            cache.put(&key, entry);
        }
        Ok(())
    }

    async fn entries(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let caches = self.caches.read().await;
        let cache = caches
            .get(name)
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(cache.keys().into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, LINK};

    fn response(url: &str, body: &str) -> Response {
        Response::new(Url::parse(url).unwrap(), StatusCode::OK, body.to_string())
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/css"))
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("v1");
        let entry = CacheEntry::from_response(
            "https://example.com/style.css",
            &response("https://example.com/style.css", "body {}"),
        );
        cache.put("https://example.com/style.css", entry);

        assert!(cache.match_request("https://example.com/style.css").is_some());
        assert!(cache.match_request("https://example.com/other.css").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        let entry = CacheEntry::from_response(
            "https://example.com/style.css",
            &response("https://example.com/style.css", "body {}"),
        );
        cache.put("https://example.com/style.css", entry);

        assert!(cache.delete("https://example.com/style.css"));
        assert!(!cache.delete("https://example.com/style.css"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_round_trips_response() {
        let original = response("https://example.com/style.css", "body {}");
        let entry = CacheEntry::from_response("https://example.com/style.css", &original);
        let restored = entry.to_response().unwrap();

        assert_eq!(restored.body, original.body);
        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.content_type(), Some("text/css"));
        assert!(restored.from_cache);
    }

    fn linked(url: &str) -> Response {
        Response::html(Url::parse(url).unwrap(), "<h1>Offline</h1>")
            .with_status_text("Offline Copy")
            .with_header(LINK, HeaderValue::from_static("</static/app.css>; rel=preload"))
            .with_header(LINK, HeaderValue::from_static("</static/manifest.json>; rel=manifest"))
    }

    #[test]
    fn test_entry_keeps_repeated_headers() {
        let original = linked("https://example.com/offline.html");
        let entry = CacheEntry::from_response("https://example.com/offline.html", &original);
        assert_eq!(entry.headers.iter().filter(|(n, _)| n == "link").count(), 2);

        let restored = entry.to_response().unwrap();
        let links: Vec<_> = restored.headers.get_all(LINK).iter().collect();
        assert_eq!(
            links,
            original.headers.get_all(LINK).iter().collect::<Vec<_>>()
        );
        assert_eq!(restored.status_text, "Offline Copy");
    }

    #[test]
    fn test_entry_without_status_text_deserializes() {
        let json = serde_json::json!({
            "url": "https://example.com/a.css",
            "method": "GET",
            "status": 200,
            "headers": [["content-type", "text/css"]],
            "body": "",
            "cached_at": 0
        });
        let entry: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.status_text, "");
        assert_eq!(entry.to_response().unwrap().content_type(), Some("text/css"));
    }

    #[test]
    fn test_entry_body_serializes_as_base64() {
        let entry = CacheEntry::from_response(
            "https://example.com/a.bin",
            &Response::new(
                Url::parse("https://example.com/a.bin").unwrap(),
                StatusCode::OK,
                vec![0u8, 159, 146, 150],
            ),
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], "AJ+Slg==");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_corrupt_entry_is_reported() {
        let mut entry = CacheEntry::from_response(
            "https://example.com/a.css",
            &response("https://example.com/a.css", "a"),
        );
        entry.status = 1000;
        assert!(matches!(
            entry.to_response(),
            Err(CacheError::CorruptEntry { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_storage_open_and_delete() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("v1").await.unwrap());
        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await.unwrap());

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_storage_put_replaces_entry() {
        let storage = MemoryCacheStorage::new();
        let key = "https://example.com/app.js";

        storage.put("v1", key, response(key, "first")).await.unwrap();
        storage.put("v1", key, response(key, "second")).await.unwrap();

        let hit = storage.match_request("v1", key).await.unwrap().unwrap();
        assert_eq!(hit.text().unwrap(), "second");
        assert_eq!(storage.entries("v1").await.unwrap(), vec![key.to_string()]);
    }

    #[tokio::test]
    async fn test_memory_storage_keeps_repeated_headers() {
        let storage = MemoryCacheStorage::new();
        let key = "https://example.com/offline.html";
        storage.put("v1", key, linked(key)).await.unwrap();

        let hit = storage.match_request("v1", key).await.unwrap().unwrap();
        assert_eq!(hit.headers.get_all(LINK).iter().count(), 2);
        assert_eq!(hit.status_text, "Offline Copy");
    }

    #[tokio::test]
    async fn test_memory_storage_match_in_missing_cache() {
        let storage = MemoryCacheStorage::new();
        assert!(storage
            .match_request("nope", "https://example.com/")
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            storage.entries("nope").await,
            Err(CacheError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_storage_keys_sorted() {
        let storage = MemoryCacheStorage::new();
        storage.open("v2").await.unwrap();
        storage.open("v1").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["v1", "v2"]);
    }
}
