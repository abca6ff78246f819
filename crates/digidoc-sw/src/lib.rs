//! # DigiDoc Service Worker
//!
//! Offline asset caching for the DigiDoc web application, modelled on a
//! browser service worker.
//!
//! ## Features
//!
//! - **Install**: pre-cache the static asset list, all or nothing
//! - **Activate**: delete every cache that is not the current version
//! - **Fetch**: network-first for navigations with an offline page fallback,
//!   cache-first for everything else
//! - **Cache storage**: in-memory and on-disk stores behind [`CacheStore`]
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost (lifecycle adapter)
//!     │
//!     ├── installing / waiting / active workers
//!     │       └── CacheInterceptor
//!     │               ├── CacheConfig (version, assets, offline page)
//!     │               ├── CacheStore  (named caches: URL → Response)
//!     │               └── Fetcher     (network)
//!     │
//!     └── events (mpsc) → StateChange / InstallFailed / CachesPurged
//! ```

use digidoc_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod disk;
pub mod host;
pub mod interceptor;

pub use cache::{Cache, CacheEntry, CacheError, CacheStore, MemoryCacheStorage};
pub use config::CacheConfig;
pub use disk::DiskCacheStorage;
pub use host::{
    LifecycleEvent, LifecycleOutcome, ServiceWorkerEvent, ServiceWorkerHost, ServiceWorkerId,
    ServiceWorkerState,
};
pub use interceptor::{CacheInterceptor, InstallOutcome};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Asset {url} rejected with status {status}")]
    AssetRejected { url: String, status: u16 },

    #[error("Offline fallback page not cached: {0}")]
    OfflineFallbackMissing(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    State(String),
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
