//! On-disk cache storage.
//!
//! Each named cache is one JSON document under the storage root. The file
//! name is the URL-encoded cache name. Writes land in a temporary file that
//! is renamed over the old one, so readers see either the old or the new
//! cache and never a torn write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use digidoc_net::Response;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cache::{Cache, CacheEntry, CacheError, CacheStore};

const EXTENSION: &str = "json";

/// Cache storage persisted as JSON files.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl DiskCacheStorage {
    /// Open storage rooted at `root`, creating the directory if needed.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Disk cache storage ready");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}.{EXTENSION}", urlencoding::encode(name)))
    }

    async fn load(&self, name: &str) -> Result<Option<Cache>, CacheError> {
        match fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, cache: &Cache) -> Result<(), CacheError> {
        let path = self.path_for(&cache.name);
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        let bytes = serde_json::to_vec(cache)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        trace!(cache = %cache.name, entries = cache.len(), "Cache written");
        Ok(())
    }

    async fn load_or_new(&self, name: &str) -> Result<Cache, CacheError> {
        Ok(self.load(name).await?.unwrap_or_else(|| Cache::new(name)))
    }
}

#[async_trait]
impl CacheStore for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        if self.load(name).await?.is_none() {
            self.store(&Cache::new(name)).await?;
        }
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(fs::try_exists(self.path_for(name)).await?)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(name) = urlencoding::decode(stem) {
                names.push(name.into_owned());
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn match_request(&self, name: &str, key: &str) -> Result<Option<Response>, CacheError> {
        let Some(cache) = self.load(name).await? else {
            return Ok(None);
        };
        cache.match_request(key).map(CacheEntry::to_response).transpose()
    }

    async fn put(&self, name: &str, key: &str, response: Response) -> Result<(), CacheError> {
        let entry = CacheEntry::from_response(key, &response);
        let _guard = self.write_lock.lock().await;
        let mut cache = self.load_or_new(name).await?;
        cache.put(key, entry);
        self.store(&cache).await
    }

    async fn put_all(&self, name: &str, entries: Vec<(String, Response)>) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut cache = self.load_or_new(name).await?;
        for (key, response) in &entries {
            cache.put(key, CacheEntry::from_response(key, response));
        }
        self.store(&cache).await
    }

    async fn entries(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let cache = self
            .load(name)
            .await?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))?;
        Ok(cache.keys().into_iter().map(str::to_string).collect())
    }
}
