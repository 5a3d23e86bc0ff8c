//! Live proxy endpoints keyed by user name.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One live per-user proxy endpoint.
pub struct Endpoint {
    /// Generation id, so self-cleanup cannot evict a successor endpoint
    /// registered under the same user name.
    pub id: Uuid,
    pub user: String,
    /// The proxy's own listening socket.
    pub sock_path: PathBuf,
    /// Flipping this to true stops the endpoint's accept loop.
    pub shutdown_tx: watch::Sender<bool>,
    /// The serving task.
    pub task: JoinHandle<()>,
}

/// Concurrency-safe user -> endpoint map, the single source of truth for
/// "is a proxy currently serving user X".
///
/// Every operation is synchronous and holds the lock only for the map
/// access itself; graceful-shutdown waits happen on endpoints already taken
/// out of the map. At most one endpoint exists per user at any time.
#[derive(Default)]
pub struct ProxyRegistry {
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl ProxyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contains(&self, user: &str) -> bool {
        self.endpoints.lock().contains_key(user)
    }

    /// Register a freshly provisioned endpoint under a single lock
    /// acquisition: `make` runs only if the user has no entry yet, and runs
    /// while the lock is held, so a serving task spawned inside it cannot
    /// reach its own `take_if` self-cleanup before the entry is visible.
    /// Returns whether the endpoint was registered.
    pub fn try_insert_with(&self, user: &str, make: impl FnOnce() -> Endpoint) -> bool {
        let mut endpoints = self.endpoints.lock();
        if endpoints.contains_key(user) {
            return false;
        }
        endpoints.insert(user.to_string(), make());
        true
    }

    /// Remove and return the endpoint for a user, if any.
    pub fn take(&self, user: &str) -> Option<Endpoint> {
        self.endpoints.lock().remove(user)
    }

    /// Remove the entry only if it still belongs to the given generation.
    /// Used by an endpoint's self-cleanup; a no-op when explicit teardown
    /// already removed it or a successor took its place.
    pub fn take_if(&self, user: &str, id: Uuid) -> Option<Endpoint> {
        let mut endpoints = self.endpoints.lock();
        if endpoints.get(user).is_some_and(|e| e.id == id) {
            endpoints.remove(user)
        } else {
            None
        }
    }

    /// Remove and return every endpoint, for the shutdown sweep.
    pub fn drain(&self) -> Vec<Endpoint> {
        self.endpoints.lock().drain().map(|(_, e)| e).collect()
    }

    pub fn users(&self) -> Vec<String> {
        self.endpoints.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }
}
