//! Integration tests for qbgate
//!
//! These spin up a real echo backend on a unix socket in a tempdir, drive
//! the lifecycle manager (directly or through the scanner) and talk to the
//! resulting proxy endpoints over their unix sockets.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use qbgate::credential::{Credential, CredentialMap, CredentialStore};
use qbgate::error::ProbeError;
use qbgate::manager::{proxy_sock_path, ProxyLifecycleManager};
use qbgate::probe::ProcessProbe;
use qbgate::registry::ProxyRegistry;
use qbgate::scanner::{CredentialScanner, LifecycleEvent, EVENT_QUEUE_DEPTH};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

/// Echo backend: replies with the request body and reports, via response
/// headers, the method, path and which sensitive headers it saw.
fn spawn_backend(sock: &Path) -> tokio::task::JoinHandle<()> {
    let listener = UnixListener::bind(sock).expect("bind backend socket");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let (parts, body) = req.into_parts();
                    let body = body.collect().await?.to_bytes();

                    let mut resp = Response::builder()
                        .header("x-echo-method", parts.method.as_str())
                        .header("x-echo-path", parts.uri.path());
                    for name in ["referer", "origin", "passwordnomatch"] {
                        if parts.headers.contains_key(name) {
                            resp = resp.header(format!("x-saw-{name}"), "1");
                        }
                    }
                    Ok::<_, hyper::Error>(resp.body(Full::new(body)).unwrap())
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    })
}

/// One request over a unix socket, hyper client side.
async fn send_request(
    sock: &Path,
    req: Request<Full<Bytes>>,
) -> Response<Incoming> {
    let stream = UnixStream::connect(sock).await.expect("connect to proxy socket");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("handshake");
    tokio::spawn(conn);
    sender.send_request(req).await.expect("send request")
}

async fn body_bytes(resp: Response<Incoming>) -> Bytes {
    resp.into_body().collect().await.unwrap().to_bytes()
}

fn credential(user: &str, secret: &str, sock: Option<&Path>) -> Credential {
    Credential {
        user: user.to_string(),
        secret: secret.to_string(),
        sock_path: sock.map(|p| p.to_string_lossy().into_owned()),
    }
}

fn store_with(creds: &[Credential]) -> Arc<CredentialStore> {
    let store = CredentialStore::new();
    let mut map = CredentialMap::new();
    for cred in creds {
        map.insert(cred.user.clone(), cred.clone());
    }
    store.replace(map);
    store
}

fn login_request(body: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("POST")
        .uri("/api/v2/auth/login")
        .header("referer", "http://attacker.example")
        .header("origin", "http://attacker.example")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_login_body_is_rewritten_with_stored_secret() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), Arc::clone(&store));
    manager.handle_added("alice");

    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    assert!(proxy_sock.exists());

    let resp = send_request(&proxy_sock, login_request("username=x&password=guess")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("x-saw-referer").is_none());
    assert!(resp.headers().get("x-saw-origin").is_none());
    assert_eq!(body_bytes(resp).await, "username=admin&password=S1");

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_non_login_body_is_forwarded_unmodified() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);
    manager.handle_added("alice");

    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    let payload = "torrents=%00%01binary+stuff&password=untouched";
    let req = Request::builder()
        .method("POST")
        .uri("/api/v2/torrents/add")
        .body(Full::new(Bytes::from(payload)))
        .unwrap();

    let resp = send_request(&proxy_sock, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-echo-path").unwrap(),
        "/api/v2/torrents/add"
    );
    assert_eq!(body_bytes(resp).await, payload);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_secret_rotation_applies_without_endpoint_churn() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), Arc::clone(&store));
    manager.handle_added("alice");

    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    let resp = send_request(&proxy_sock, login_request("password=x")).await;
    assert_eq!(body_bytes(resp).await, "username=admin&password=S1");

    // Rotate the secret in place; the existing endpoint must pick it up on
    // the very next login.
    let mut map = CredentialMap::new();
    let cred = credential("alice", "S2", Some(&backend_sock));
    map.insert(cred.user.clone(), cred);
    store.replace(map);

    let resp = send_request(&proxy_sock, login_request("password=x")).await;
    assert_eq!(body_bytes(resp).await, "username=admin&password=S2");

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_gate_mismatch_signal_blanks_the_secret() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);
    manager.handle_added("alice");

    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    let req = Request::builder()
        .method("POST")
        .uri("/api/v2/auth/login")
        .header("PasswordNomatch", "true")
        .body(Full::new(Bytes::from("password=whatever")))
        .unwrap();

    let resp = send_request(&proxy_sock, req).await;
    // The signal header is consumed, never forwarded.
    assert!(resp.headers().get("x-saw-passwordnomatch").is_none());
    assert_eq!(body_bytes(resp).await, "username=admin&password=");

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_missing_backend_socket_is_reported_not_hung() {
    let dir = tempfile::tempdir().unwrap();
    // Credential points at a socket that never existed; the proxy endpoint
    // itself still binds fine.
    let backend_sock = dir.path().join("alice.sock");

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);
    manager.handle_added("alice");

    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    let resp = send_request(&proxy_sock, login_request("password=x")).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        resp.headers().get("X-Proxy-Error").unwrap(),
        "UPSTREAM_UNAVAILABLE"
    );

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_removed_endpoint_cleans_up_its_socket() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);
    manager.handle_added("alice");

    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    assert!(proxy_sock.exists());

    manager.handle_removed("alice").await;
    assert!(!proxy_sock.exists());
    assert!(!registry.contains("alice"));

    // Removing again is a no-op.
    manager.handle_removed("alice").await;
}

#[tokio::test]
async fn test_duplicate_added_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);

    manager.handle_added("alice");
    manager.handle_added("alice");
    assert_eq!(registry.len(), 1);

    // The endpoint still serves after the duplicate event.
    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    let resp = send_request(&proxy_sock, login_request("password=x")).await;
    assert_eq!(resp.status(), StatusCode::OK);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_user_without_socket_path_is_not_provisioned() {
    let store = store_with(&[credential("alice", "S1", None)]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);

    manager.handle_added("alice");
    assert!(registry.is_empty());

    // Removal for the never-provisioned user is still honored as a no-op.
    manager.handle_removed("alice").await;
}

#[tokio::test]
async fn test_provisioning_failures_are_independent_per_user() {
    let dir = tempfile::tempdir().unwrap();
    let alice_sock = dir.path().join("alice.sock");
    spawn_backend(&alice_sock);

    // Bob's socket directory does not exist, so his endpoint cannot bind.
    let bob_sock = PathBuf::from("/nonexistent-qbgate-test/bob.sock");

    let store = store_with(&[
        credential("alice", "S1", Some(&alice_sock)),
        credential("bob", "S2", Some(&bob_sock)),
    ]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);

    manager.handle_added("bob");
    manager.handle_added("alice");

    assert!(registry.contains("alice"));
    assert!(!registry.contains("bob"));

    let proxy_sock = proxy_sock_path(&alice_sock.to_string_lossy(), "alice");
    let resp = send_request(&proxy_sock, login_request("password=x")).await;
    assert_eq!(body_bytes(resp).await, "username=admin&password=S1");

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_added_then_removed_ends_with_no_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let store = store_with(&[credential("alice", "S1", Some(&backend_sock))]);
    let registry = ProxyRegistry::new();
    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), store);

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    tx.send(LifecycleEvent::Added("alice".into())).await.unwrap();
    tx.send(LifecycleEvent::Removed("alice".into())).await.unwrap();
    drop(tx);

    // The consumer drains both queued events in order and then exits.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    manager.run(rx, shutdown_rx).await;

    assert!(!registry.contains("alice"));
    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    assert!(!proxy_sock.exists());
}

/// Probe whose process table is controlled by the test.
#[derive(Clone, Default)]
struct FakeProbe {
    cmdlines: Arc<Mutex<Vec<String>>>,
}

impl FakeProbe {
    fn set_processes(&self, cmdlines: Vec<String>) {
        *self.cmdlines.lock() = cmdlines;
    }
}

#[async_trait]
impl ProcessProbe for FakeProbe {
    async fn list_pids(&self) -> Result<Vec<u32>, ProbeError> {
        let count = self.cmdlines.lock().len() as u32;
        if count == 0 {
            return Err(ProbeError::NotFound);
        }
        Ok((0..count).collect())
    }

    async fn command_line(&self, pid: u32) -> Result<String, ProbeError> {
        self.cmdlines
            .lock()
            .get(pid as usize)
            .cloned()
            .ok_or_else(|| ProbeError::Query(format!("unknown pid {pid}")))
    }
}

#[tokio::test]
async fn test_engine_follows_process_churn_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let backend_sock = dir.path().join("alice.sock");
    spawn_backend(&backend_sock);

    let probe = FakeProbe::default();
    probe.set_processes(vec![format!(
        "qbittorrent-nox --profile=/home/alice/.config \
         --webui-password=S1 --webui-sock-path={}",
        backend_sock.display()
    )]);

    let store = CredentialStore::new();
    let registry = ProxyRegistry::new();
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scanner = CredentialScanner::new(probe.clone(), Arc::clone(&store), event_tx)
        .with_interval(Duration::from_millis(50));
    let scanner_handle = tokio::spawn(scanner.run(shutdown_rx.clone()));

    let manager = ProxyLifecycleManager::new(Arc::clone(&registry), Arc::clone(&store));
    let manager_handle = tokio::spawn(manager.run(event_rx, shutdown_rx));

    // Discovery provisions the endpoint.
    let proxy_sock = proxy_sock_path(&backend_sock.to_string_lossy(), "alice");
    assert!(
        wait_for(|| proxy_sock.exists(), Duration::from_secs(2)).await,
        "endpoint was not provisioned"
    );

    let resp = send_request(&proxy_sock, login_request("password=guess")).await;
    assert_eq!(body_bytes(resp).await, "username=admin&password=S1");

    // The backend process disappears; the endpoint follows within a scan.
    probe.set_processes(vec![]);
    assert!(
        wait_for(|| !proxy_sock.exists(), Duration::from_secs(2)).await,
        "endpoint was not torn down"
    );
    assert!(registry.is_empty());

    let _ = shutdown_tx.send(true);
    let _ = scanner_handle.await;
    let _ = manager_handle.await;
}
