//! Periodic process-table scans and snapshot diffing.
//!
//! The scanner is the only writer of the [`CredentialStore`]. On every tick
//! it rebuilds the credential snapshot from the live process table, diffs
//! it against the previous one and emits one lifecycle event per user that
//! appeared or disappeared. Users present in both snapshots are not
//! re-announced even if their secret or socket path changed; endpoints read
//! credentials live, so only the listening socket location of an existing
//! endpoint stays pinned until a remove/add cycle.

use crate::credential::{extract_credential, CredentialMap, CredentialStore};
use crate::error::ProbeError;
use crate::probe::ProcessProbe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How often the process table is rescanned.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Depth of the lifecycle event queue. Sends block when the queue is full,
/// stalling the next scan tick rather than buffering events unboundedly.
pub const EVENT_QUEUE_DEPTH: usize = 10;

/// A user-level transition detected between two consecutive scans.
///
/// Emitted exactly once per user per transition, consumed by the single
/// lifecycle manager loop. Events for one user are delivered in emission
/// order; there is no ordering guarantee across users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Added(String),
    Removed(String),
}

pub struct CredentialScanner<P> {
    probe: P,
    store: Arc<CredentialStore>,
    events: mpsc::Sender<LifecycleEvent>,
    interval: Duration,
}

impl<P: ProcessProbe> CredentialScanner<P> {
    pub fn new(
        probe: P,
        store: Arc<CredentialStore>,
        events: mpsc::Sender<LifecycleEvent>,
    ) -> Self {
        Self {
            probe,
            store,
            events,
            interval: SCAN_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Scan until the shutdown signal flips. The first scan runs
    /// immediately, before the first tick.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting credential scanner");

        if let Err(e) = self.scan_once().await {
            warn!(error = %e, "Initial scan failed");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.scan_once().await {
                        warn!(error = %e, "Scan failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Credential scanner shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One full scan cycle: rebuild the snapshot, swap it in, announce the
    /// diff. The swap happens before announcing so the lifecycle consumer
    /// always finds a freshly added user in the store.
    async fn scan_once(&self) -> Result<(), ProbeError> {
        let next = self.collect().await?;
        let prev = self.store.snapshot();
        self.store.replace(next.clone());

        // Removed first, then added, per scan.
        for user in prev.keys() {
            if !next.contains_key(user) {
                debug!(user, "User disappeared");
                self.emit(LifecycleEvent::Removed(user.clone())).await;
            }
        }
        for user in next.keys() {
            if !prev.contains_key(user) {
                debug!(user, "User appeared");
                self.emit(LifecycleEvent::Added(user.clone())).await;
            }
        }
        Ok(())
    }

    /// Build a fresh credential map from the process table. A probe query
    /// failure aborts the scan (stale snapshot kept); no matching processes
    /// at all yields an empty map, which removes every known user.
    async fn collect(&self) -> Result<CredentialMap, ProbeError> {
        let pids = match self.probe.list_pids().await {
            Ok(pids) => pids,
            Err(ProbeError::NotFound) => {
                // Total loss of the backend process is treated as total
                // loss of its users.
                warn!("No backend processes found, clearing all users");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut next = CredentialMap::new();
        for pid in pids {
            let cmdline = match self.probe.command_line(pid).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(pid, error = %e, "Failed to read command line");
                    continue;
                }
            };
            match extract_credential(&cmdline) {
                Ok(cred) => {
                    debug!(
                        user = %cred.user,
                        pid,
                        has_socket = cred.sock_path.is_some(),
                        "Extracted credentials"
                    );
                    next.insert(cred.user.clone(), cred);
                }
                Err(e) => {
                    warn!(pid, error = %e, "Skipping candidate process");
                }
            }
        }
        Ok(next)
    }

    async fn emit(&self, event: LifecycleEvent) {
        // Blocking send: back-pressure from a slow consumer stalls the scan.
        if self.events.send(event).await.is_err() {
            debug!("Event consumer gone, dropping event");
        }
    }
}
