//! Endpoint provisioning and teardown driven by lifecycle events.

use crate::credential::CredentialStore;
use crate::error::ProvisionError;
use crate::registry::{Endpoint, ProxyRegistry};
use crate::rewrite::RequestRewriter;
use crate::scanner::LifecycleEvent;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bound on graceful endpoint shutdown before the serving task is aborted.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Suffix appended to the user name to form the endpoint socket file name.
const PROXY_SOCK_SUFFIX: &str = "-proxy.sock";

/// Deterministic endpoint socket path: same directory as the backend's own
/// socket, named after the user. Teardown can always recompute it even if
/// the endpoint record were lost.
pub fn proxy_sock_path(backend_sock: &str, user: &str) -> PathBuf {
    let dir = Path::new(backend_sock)
        .parent()
        .unwrap_or_else(|| Path::new("."));
    dir.join(format!("{user}{PROXY_SOCK_SUFFIX}"))
}

/// Consumes lifecycle events and keeps the endpoint set in step with the
/// credential snapshot: one listening unix socket per discovered user.
pub struct ProxyLifecycleManager {
    registry: Arc<ProxyRegistry>,
    store: Arc<CredentialStore>,
}

impl ProxyLifecycleManager {
    pub fn new(registry: Arc<ProxyRegistry>, store: Arc<CredentialStore>) -> Self {
        Self { registry, store }
    }

    /// Single-consumer event loop. Events for one user are processed in
    /// emission order. On shutdown, every live endpoint is swept.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<LifecycleEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting proxy lifecycle manager");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(LifecycleEvent::Added(user)) => self.handle_added(&user),
                        Some(LifecycleEvent::Removed(user)) => self.handle_removed(&user).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Shutting down all proxy endpoints");
        self.shutdown_all().await;
    }

    /// Provision an endpoint for a newly discovered user. Idempotent:
    /// duplicate Added events and users without a usable socket path are
    /// no-ops.
    pub fn handle_added(&self, user: &str) {
        let Some(cred) = self.store.get(user) else {
            warn!(user, "Credentials not found, skipping endpoint");
            return;
        };
        let Some(backend_sock) = cred.sock_path else {
            warn!(user, "Credential has no socket path, skipping endpoint");
            return;
        };
        if self.registry.contains(user) {
            debug!(user, "Endpoint already exists");
            return;
        }
        match self.provision(user, &backend_sock) {
            Ok(()) => info!(user, "Proxy endpoint created"),
            Err(e) => error!(user, error = %e, "Failed to provision endpoint"),
        }
    }

    /// Tear down the endpoint for a departed user. No-op if none exists.
    pub async fn handle_removed(&self, user: &str) {
        let Some(endpoint) = self.registry.take(user) else {
            debug!(user, "No endpoint to remove");
            return;
        };
        shutdown_endpoint(endpoint).await;
        info!(user, "Proxy endpoint removed");
    }

    /// Graceful-then-forced teardown of every live endpoint.
    pub async fn shutdown_all(&self) {
        for endpoint in self.registry.drain() {
            shutdown_endpoint(endpoint).await;
        }
    }

    fn provision(&self, user: &str, backend_sock: &str) -> Result<(), ProvisionError> {
        let sock_path = proxy_sock_path(backend_sock, user);

        // Unlink any stale socket left over from a previous run.
        remove_socket_file(&sock_path);

        let listener = UnixListener::bind(&sock_path).map_err(|source| ProvisionError::Bind {
            path: sock_path.clone(),
            source,
        })?;

        // Callers connect as other local users, so the socket must be
        // world-writable.
        if let Err(e) =
            std::fs::set_permissions(&sock_path, std::fs::Permissions::from_mode(0o666))
        {
            error!(path = %sock_path.display(), error = %e, "Failed to set socket permissions");
        }

        // The serving task is spawned while the registry lock is held, so
        // its entry is visible before the task can run its self-cleanup.
        let inserted = self.registry.try_insert_with(user, || {
            let id = Uuid::new_v4();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let rewriter = RequestRewriter::new(user, Arc::clone(&self.store));

            let task = tokio::spawn(serve_endpoint(
                listener,
                rewriter,
                shutdown_rx,
                Arc::clone(&self.registry),
                user.to_string(),
                sock_path.clone(),
                id,
            ));

            Endpoint {
                id,
                user: user.to_string(),
                sock_path: sock_path.clone(),
                shutdown_tx,
                task,
            }
        });

        if !inserted {
            // Cannot happen while this loop is the only creator; contains()
            // was checked above.
            warn!(user, "Endpoint already registered, dropping duplicate listener");
            remove_socket_file(&sock_path);
        }
        Ok(())
    }
}

/// Ask the serving task to stop and wait up to [`SHUTDOWN_TIMEOUT`]; on
/// timeout, abort it outright. Socket cleanup runs in both cases and is
/// idempotent with the task's own self-cleanup.
async fn shutdown_endpoint(endpoint: Endpoint) {
    let Endpoint {
        user,
        sock_path,
        shutdown_tx,
        task,
        ..
    } = endpoint;

    let abort = task.abort_handle();
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
        Ok(_) => debug!(user = %user, "Endpoint shut down gracefully"),
        Err(_) => {
            warn!(user = %user, "Graceful shutdown timed out, forcing close");
            abort.abort();
        }
    }

    remove_socket_file(&sock_path);
}

fn remove_socket_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

/// Accept loop for one endpoint. On exit (shutdown or accept failure) the
/// task drains in-flight connections, removes its own registry entry and
/// unlinks its socket file; the explicit teardown path tolerates both
/// already being done.
async fn serve_endpoint(
    listener: UnixListener,
    rewriter: RequestRewriter,
    mut shutdown_rx: watch::Receiver<bool>,
    registry: Arc<ProxyRegistry>,
    user: String,
    sock_path: PathBuf,
    id: Uuid,
) {
    info!(user = %user, path = %sock_path.display(), "Serving proxy endpoint");
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let rewriter = rewriter.clone();
                        connections.spawn(async move {
                            let service = service_fn(move |req| {
                                let rewriter = rewriter.clone();
                                async move { rewriter.handle(req).await }
                            });
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                                .await
                            {
                                debug!(error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(user = %user, error = %e, "Accept failed, closing endpoint");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(user = %user, "Endpoint shutdown requested");
                    break;
                }
            }
        }
    }

    // Stop accepting, then drain in-flight connections; the teardown path
    // bounds this wait.
    drop(listener);
    while connections.join_next().await.is_some() {}

    if registry.take_if(&user, id).is_some() {
        debug!(user = %user, "Endpoint removed itself from registry");
    }
    remove_socket_file(&sock_path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_sock_path_is_deterministic() {
        assert_eq!(
            proxy_sock_path("/run/qbt/alice.sock", "alice"),
            PathBuf::from("/run/qbt/alice-proxy.sock")
        );
        assert_eq!(
            proxy_sock_path("/x/qbt.sock", "bob"),
            PathBuf::from("/x/bob-proxy.sock")
        );
    }
}
