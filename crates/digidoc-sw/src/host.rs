//! Worker lifecycle host.
//!
//! Plays the part of the browser: it holds the installing, waiting and
//! active worker slots, routes lifecycle events to the right
//! [`CacheInterceptor`], and reports state changes on a channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use digidoc_net::{Fetcher, Request, Response};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::interceptor::{CacheInterceptor, InstallOutcome};
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Registered, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// Lifecycle signals delivered to a worker.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(Request),
}

/// What a dispatched event produced.
#[derive(Debug)]
pub enum LifecycleOutcome {
    Installed(InstallOutcome),
    Activated { removed_caches: Vec<String> },
    Response(Response),
}

/// Notifications emitted by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A worker moved to a new state.
    StateChange {
        worker_id: ServiceWorkerId,
        cache_version: String,
        new_state: ServiceWorkerState,
    },
    /// Install failed; the worker is redundant.
    InstallFailed {
        worker_id: ServiceWorkerId,
        error: String,
    },
    /// Activation removed stale caches.
    CachesPurged { removed: Vec<String> },
}

// ==================== Worker ====================

#[derive(Debug, Clone)]
struct Worker {
    id: ServiceWorkerId,
    interceptor: Arc<CacheInterceptor>,
    state: ServiceWorkerState,
    state_changed_at: Instant,
}

impl Worker {
    fn new(interceptor: CacheInterceptor) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            interceptor: Arc::new(interceptor),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    fn cache_version(&self) -> String {
        self.interceptor.cache_name().to_string()
    }
}

#[derive(Debug, Default)]
struct Registration {
    installing: Option<Worker>,
    waiting: Option<Worker>,
    active: Option<Worker>,
    /// State of every worker that is not yet redundant.
    states: HashMap<ServiceWorkerId, ServiceWorkerState>,
}

// ==================== Host ====================

/// Drives one registration through install, activate and fetch.
pub struct ServiceWorkerHost {
    registration: RwLock<Registration>,
    /// Used for pages no worker controls yet.
    network: Arc<dyn Fetcher>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a host with no workers.
    pub fn new(network: Arc<dyn Fetcher>) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(Registration::default()),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    /// Register a new worker version and run it through install.
    ///
    /// If install succeeds and asks to skip waiting, the worker is activated
    /// straight away. If install fails the worker becomes redundant and the
    /// previous active worker keeps serving.
    pub async fn register(&self, interceptor: CacheInterceptor) -> Result<ServiceWorkerId> {
        let worker = Worker::new(interceptor);
        let id = worker.id;
        info!(worker = ?id, cache = %worker.cache_version(), "Registering worker");

        {
            let mut reg = self.registration.write().await;
            if let Some(replaced) = reg.installing.take() {
                self.transition(&mut reg, replaced, ServiceWorkerState::Redundant);
            }
            reg.states.insert(id, worker.state);
            reg.installing = Some(worker);
        }

        let outcome = self.install().await?;
        if outcome.skip_waiting {
            self.activate_waiting().await?;
        }
        Ok(id)
    }

    /// Route a lifecycle event.
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<LifecycleOutcome> {
        match event {
            LifecycleEvent::Install => Ok(LifecycleOutcome::Installed(self.install().await?)),
            LifecycleEvent::Activate => Ok(LifecycleOutcome::Activated {
                removed_caches: self.activate_waiting().await?,
            }),
            LifecycleEvent::Fetch(request) => {
                Ok(LifecycleOutcome::Response(self.handle_fetch(&request).await?))
            }
        }
    }

    /// Run the install handler of the installing worker.
    pub async fn install(&self) -> Result<InstallOutcome> {
        let worker = {
            let mut reg = self.registration.write().await;
            let worker = reg
                .installing
                .take()
                .ok_or_else(|| ServiceWorkerError::State("no worker is installing".to_string()))?;
            let worker = self.transition(&mut reg, worker, ServiceWorkerState::Installing);
            reg.installing = Some(worker.clone());
            worker
        };

        let result = worker.interceptor.on_install().await;

        let mut reg = self.registration.write().await;
        // A newer registration may have replaced this worker meanwhile.
        let still_installing = reg.installing.as_ref().is_some_and(|w| w.id == worker.id);
        if still_installing {
            reg.installing = None;
        }

        match result {
            Ok(outcome) if still_installing => {
                if let Some(previous) = reg.waiting.take() {
                    self.transition(&mut reg, previous, ServiceWorkerState::Redundant);
                }
                let worker = self.transition(&mut reg, worker, ServiceWorkerState::Installed);
                reg.waiting = Some(worker);
                Ok(outcome)
            }
            Ok(_) => Err(ServiceWorkerError::State(
                "worker was replaced during install".to_string(),
            )),
            Err(e) => {
                warn!(worker = ?worker.id, error = %e, "Install failed");
                let id = worker.id;
                self.transition(&mut reg, worker, ServiceWorkerState::Redundant);
                let _ = self.event_tx.send(ServiceWorkerEvent::InstallFailed {
                    worker_id: id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Promote the waiting worker and run its activate handler.
    ///
    /// The new worker controls fetches from the moment it starts
    /// activating; its cache is already complete, so pages never fall back
    /// to the bare network during the handover. It is marked activated
    /// even if cache cleanup fails; the cleanup error is still returned.
    pub async fn activate_waiting(&self) -> Result<Vec<String>> {
        let worker = {
            let mut reg = self.registration.write().await;
            let worker = reg
                .waiting
                .take()
                .ok_or_else(|| ServiceWorkerError::State("no worker is waiting".to_string()))?;
            if let Some(old) = reg.active.take() {
                self.transition(&mut reg, old, ServiceWorkerState::Redundant);
            }
            let worker = self.transition(&mut reg, worker, ServiceWorkerState::Activating);
            reg.active = Some(worker.clone());
            worker
        };

        let result = worker.interceptor.on_activate().await;

        {
            let mut reg = self.registration.write().await;
            // A later activation may already have retired this worker.
            if let Some(active) = reg.active.take() {
                let active = if active.id == worker.id {
                    self.transition(&mut reg, active, ServiceWorkerState::Activated)
                } else {
                    active
                };
                reg.active = Some(active);
            }
        }

        let removed = result?;
        if !removed.is_empty() {
            let _ = self.event_tx.send(ServiceWorkerEvent::CachesPurged {
                removed: removed.clone(),
            });
        }
        Ok(removed)
    }

    /// Answer a request through the active worker, or straight from the
    /// network when no worker controls the page.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Response> {
        let active = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| Arc::clone(&w.interceptor));

        match active {
            Some(interceptor) => interceptor.on_fetch(request).await,
            None => {
                debug!(url = %request.url, "Uncontrolled fetch");
                Ok(self.network.fetch(request).await?)
            }
        }
    }

    /// Current state of a worker, or `None` once it is redundant. The
    /// event channel still reports the final `Redundant` transition.
    pub async fn state(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        self.registration.read().await.states.get(&id).copied()
    }

    /// Cache version of the active worker.
    pub async fn active_cache_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .active
            .as_ref()
            .map(Worker::cache_version)
    }

    /// Whether a worker currently controls fetches.
    pub async fn is_controlled(&self) -> bool {
        self.registration.read().await.active.is_some()
    }

    fn transition(
        &self,
        reg: &mut Registration,
        mut worker: Worker,
        new_state: ServiceWorkerState,
    ) -> Worker {
        debug!(
            worker = ?worker.id,
            from = %worker.state,
            to = %new_state,
            after = ?worker.state_changed_at.elapsed(),
            "Worker state change"
        );
        worker.state = new_state;
        worker.state_changed_at = Instant::now();
        if new_state == ServiceWorkerState::Redundant {
            reg.states.remove(&worker.id);
        } else {
            reg.states.insert(worker.id, new_state);
        }
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            cache_version: worker.cache_version(),
            new_state,
        });
        worker
    }
}
