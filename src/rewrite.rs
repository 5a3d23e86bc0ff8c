//! Per-endpoint reverse-proxy logic with login credential rewriting.

use crate::credential::CredentialStore;
use crate::error::{json_error_response, ProxyErrorCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, ORIGIN, REFERER, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixStream;
use tracing::{debug, error, warn};

/// Login endpoint whose credentials get rewritten (substring match).
pub const LOGIN_API_PATH: &str = "/api/v2/auth/login";

/// Signal header set by an upstream gate proxy when the caller failed the
/// gate password check. Consumed here, never forwarded to the backend.
pub const PASSWORD_NOMATCH_HEADER: &str = "passwordnomatch";

/// Per-endpoint proxy logic bound to one user name.
///
/// Credentials are looked up live on every request rather than captured at
/// endpoint creation, so a rotated secret or a moved backend socket is
/// picked up without recreating the endpoint.
#[derive(Clone)]
pub struct RequestRewriter {
    user: String,
    store: Arc<CredentialStore>,
}

impl RequestRewriter {
    pub fn new(user: impl Into<String>, store: Arc<CredentialStore>) -> Self {
        Self {
            user: user.into(),
            store,
        }
    }

    /// Proxy one request to the bound user's backend socket. Failures are
    /// surfaced to the caller as JSON error responses, never retried.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let Some(cred) = self.store.get(&self.user) else {
            warn!(user = %self.user, "No credential for user");
            return Ok(json_error_response(
                ProxyErrorCode::CredentialMissing,
                "No backend registered for this endpoint",
            ));
        };
        let Some(sock_path) = cred.sock_path else {
            warn!(user = %self.user, "Credential has no backend socket path");
            return Ok(json_error_response(
                ProxyErrorCode::CredentialMissing,
                "No backend registered for this endpoint",
            ));
        };

        if !Path::new(&sock_path).exists() {
            warn!(user = %self.user, path = %sock_path, "Target socket does not exist");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                "Backend socket is not available",
            ));
        }

        let (mut parts, body) = req.into_parts();
        debug!(
            user = %self.user,
            method = %parts.method,
            path = %parts.uri.path(),
            "Incoming request"
        );

        let mut body = body.collect().await?.to_bytes();

        if parts.uri.path().contains(LOGIN_API_PATH) {
            let mut secret = cred.secret;
            // An upstream gate already rejected this caller: blank the
            // secret so the backend fails the login.
            if parts.headers.contains_key(PASSWORD_NOMATCH_HEADER) {
                debug!(user = %self.user, "Gate mismatch signal present, blanking secret");
                secret.clear();
            }
            body = login_body(&secret);
        }

        strip_sensitive_headers(&mut parts.headers);
        set_content_length(&mut parts.headers, body.len());

        match forward(&sock_path, parts, body).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                error!(user = %self.user, path = %sock_path, error = %e, "Upstream request failed");
                Ok(json_error_response(
                    ProxyErrorCode::UpstreamUnavailable,
                    "Failed to reach backend",
                ))
            }
        }
    }
}

/// Rewritten login form. The backend always authenticates as `admin`.
pub fn login_body(secret: &str) -> Bytes {
    Bytes::from(format!("username=admin&password={secret}"))
}

/// Extract the `password` field from a urlencoded login form.
pub fn form_password(body: &str) -> Option<&str> {
    body.split('&').find_map(|part| part.strip_prefix("password="))
}

/// Drop headers that must never reach the backend.
pub(crate) fn strip_sensitive_headers(headers: &mut HeaderMap) {
    headers.remove(REFERER);
    headers.remove(ORIGIN);
    headers.remove(PASSWORD_NOMATCH_HEADER);
}

/// Recompute framing for the (possibly rewritten) buffered body.
pub(crate) fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

/// Dial the backend socket and forward the rewritten request, streaming the
/// response back unmodified.
pub(crate) async fn forward(
    sock_path: &str,
    mut parts: Parts,
    body: Bytes,
) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let stream = UnixStream::connect(sock_path).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Backend connection closed with error");
        }
    });

    // The socket itself is the authority; requests go out in origin form
    // with a stable host.
    parts.headers.insert(HOST, HeaderValue::from_static("localhost"));
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder().method(parts.method).uri(path_and_query);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    let req = builder.body(Full::new(body))?;

    let resp = sender.send_request(req).await?;
    let (parts, body) = resp.into_parts();
    Ok(Response::from_parts(parts, body.boxed()))
}
