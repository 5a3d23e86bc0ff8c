//! Credential records extracted from backend command lines, and the shared
//! snapshot store that endpoints read at request time.

use crate::error::ExtractError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Profile prefix the owning user name is derived from.
const PROFILE_PREFIX: &str = "--profile=/home/";
/// Command-line option carrying the Web UI secret.
const PASSWORD_OPTION: &str = "--webui-password=";
/// Command-line option carrying the private socket path.
const SOCK_OPTION: &str = "--webui-sock-path=";

/// One backend instance's authentication and transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Owning local user, the unique key for the instance.
    pub user: String,
    /// Web UI secret injected into login requests.
    pub secret: String,
    /// Private backend socket. `None` when the instance was started without
    /// one; such users are discovered but cannot be proxied.
    pub sock_path: Option<String>,
}

/// Parse one command line into a credential record.
///
/// Options are recognized in any order. User name and secret are required;
/// the socket path is optional.
pub fn extract_credential(cmdline: &str) -> Result<Credential, ExtractError> {
    let mut user = None;
    let mut secret = None;
    let mut sock_path = None;

    for token in cmdline.split_whitespace() {
        if let Some(rest) = token.strip_prefix(PROFILE_PREFIX) {
            // /home/<user>/... - the user name is the first path segment
            let name = rest.split('/').next().unwrap_or("");
            if !name.is_empty() {
                user = Some(name.to_string());
            }
        } else if let Some(value) = token.strip_prefix(PASSWORD_OPTION) {
            if !value.is_empty() {
                secret = Some(value.to_string());
            }
        } else if let Some(value) = token.strip_prefix(SOCK_OPTION) {
            if !value.is_empty() {
                sock_path = Some(value.to_string());
            }
        }
    }

    let user = user.ok_or(ExtractError::MissingField("profile"))?;
    let secret = secret.ok_or(ExtractError::MissingField("webui-password"))?;
    Ok(Credential {
        user,
        secret,
        sock_path,
    })
}

/// Full credential snapshot keyed by user name.
pub type CredentialMap = HashMap<String, Credential>;

/// Single-writer, many-reader credential state.
///
/// The scanner replaces the whole snapshot after each scan; nothing mutates
/// entries in place. Endpoints look credentials up by user name on every
/// request, so a rotated secret takes effect without recreating the
/// endpoint. Readers always see either the old or the new complete
/// snapshot, never a partial one.
#[derive(Default)]
pub struct CredentialStore {
    snapshot: RwLock<Arc<CredentialMap>>,
}

impl CredentialStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current complete snapshot.
    pub fn snapshot(&self) -> Arc<CredentialMap> {
        Arc::clone(&self.snapshot.read())
    }

    /// Atomically replace the snapshot.
    pub fn replace(&self, next: CredentialMap) {
        *self.snapshot.write() = Arc::new(next);
    }

    /// Live lookup for one user.
    pub fn get(&self, user: &str) -> Option<Credential> {
        self.snapshot.read().get(user).cloned()
    }
}
