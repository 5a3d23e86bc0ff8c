//! Single-tenant deployment mode: one backend socket, one always-on TCP
//! listening port, secret sourced from a file.
//!
//! This is the front-gate sibling of the multi-tenant engine. An operator
//! gate password, when configured, restricts who may trigger the login
//! substitution: a caller whose login form fails the gate check has their
//! own (wrong) password forwarded and the `PasswordNomatch` signal header
//! set. Served directly, the backend then rejects the login itself; behind
//! a chained multi-tenant endpoint, the signal makes that endpoint blank
//! its secret.

use crate::error::{json_error_response, ProxyErrorCode};
use crate::rewrite::{
    forward, form_password, login_body, set_content_length, strip_sensitive_headers,
    LOGIN_API_PATH, PASSWORD_NOMATCH_HEADER,
};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often the secret file is re-read.
pub const SECRET_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct SingleProxyConfig {
    /// TCP port the proxy listens on.
    pub port: u16,
    /// The backend's unix domain socket.
    pub backend_sock: String,
    /// File the backend secret is read from.
    pub secret_file: PathBuf,
    /// Operator gate password; `None` accepts any caller.
    pub gate_password: Option<String>,
}

struct SingleContext {
    backend_sock: String,
    secret: Arc<RwLock<String>>,
    gate_password: Option<String>,
}

/// Serve the single-tenant proxy until the shutdown signal flips.
pub async fn run(
    config: SingleProxyConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let secret = Arc::new(RwLock::new(String::new()));
    let watcher = SecretWatcher::new(config.secret_file, Arc::clone(&secret));
    tokio::spawn(watcher.run(shutdown_rx.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        port = config.port,
        backend = %config.backend_sock,
        gated = config.gate_password.is_some(),
        "Single-tenant proxy listening"
    );

    let ctx = Arc::new(SingleContext {
        backend_sock: config.backend_sock,
        secret,
        gate_password: config.gate_password,
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let ctx = Arc::clone(&ctx);
                                async move { handle_request(req, ctx).await }
                            });
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                                .await
                            {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Single-tenant proxy shutting down");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: Arc<SingleContext>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if !Path::new(&ctx.backend_sock).exists() {
        warn!(path = %ctx.backend_sock, "Target socket does not exist");
        return Ok(json_error_response(
            ProxyErrorCode::UpstreamUnavailable,
            "Backend socket is not available",
        ));
    }

    let (mut parts, body) = req.into_parts();
    debug!(method = %parts.method, path = %parts.uri.path(), "Incoming request");

    let mut body = body.collect().await?.to_bytes();

    let mut signal_mismatch = false;
    if parts.uri.path().contains(LOGIN_API_PATH) {
        let stored = ctx.secret.read().clone();
        let (secret, mismatch) = {
            let form = String::from_utf8_lossy(&body);
            let caller_password = form_password(&form).unwrap_or("");
            gated_secret(&stored, ctx.gate_password.as_deref(), caller_password)
        };
        signal_mismatch = mismatch;
        body = login_body(&secret);
    }

    strip_sensitive_headers(&mut parts.headers);
    if signal_mismatch {
        parts
            .headers
            .insert(PASSWORD_NOMATCH_HEADER, HeaderValue::from_static("true"));
    }
    set_content_length(&mut parts.headers, body.len());

    match forward(&ctx.backend_sock, parts, body).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            error!(path = %ctx.backend_sock, error = %e, "Upstream request failed");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                "Failed to reach backend",
            ))
        }
    }
}

/// Password to inject given the gate policy. Returns the password and
/// whether the caller failed the gate check. On a mismatch the caller's own
/// password is passed through, so the backend fails the login on its own.
fn gated_secret(stored: &str, gate: Option<&str>, caller_password: &str) -> (String, bool) {
    match gate {
        Some(gate) if caller_password != gate => (caller_password.to_string(), true),
        _ => (stored.to_string(), false),
    }
}

/// Polls the secret file, mirroring its content into shared state.
pub struct SecretWatcher {
    path: PathBuf,
    secret: Arc<RwLock<String>>,
    interval: Duration,
}

impl SecretWatcher {
    pub fn new(path: PathBuf, secret: Arc<RwLock<String>>) -> Self {
        Self {
            path,
            secret,
            interval: SECRET_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => self.poll().await,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Secret watcher shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn poll(&self) {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let content = content.trim_end().to_string();
                if !content.is_empty() && *self.secret.read() != content {
                    *self.secret.write() = content;
                    info!("Backend secret updated");
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Secret file does not exist");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read secret file");
            }
        }
    }
}
