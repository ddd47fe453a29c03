//! Authenticators decorating outgoing requests.

use crate::http::{HttpClient, HttpRequest};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Path of the cookie login endpoint relative to the database.
pub const SESSION_PATH: &str = "_session";

/// Credential capability consumed by a replication session.
///
/// The selection of credentials is left to the embedder; the session only
/// asks the authenticator to decorate requests and, for cookie-based
/// schemes, where and with what parameters to log in.
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// An HTTP client to use instead of the session's default one.
    fn http_client(&self) -> Option<Arc<dyn HttpClient>> {
        None
    }

    /// True if the session must check for (and possibly create) a login
    /// session before replicating.
    fn uses_session_login(&self) -> bool;

    /// Login endpoint path relative to the remote database.
    fn login_path(&self, remote: &Url) -> Option<String>;

    /// Body of the login request.
    fn login_parameters(&self, remote: &Url) -> Option<Map<String, Value>>;

    /// Adds credentials to a request.
    fn decorate(&self, request: HttpRequest) -> HttpRequest {
        request
    }
}

/// Sends HTTP basic credentials with every request.
#[derive(Clone)]
pub struct BasicAuthenticator {
    user: String,
    password: String,
}

impl BasicAuthenticator {
    /// Creates a basic authenticator.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthenticator")
            .field("user", &self.user)
            .field("password", &"*****")
            .finish()
    }
}

impl Authenticator for BasicAuthenticator {
    fn uses_session_login(&self) -> bool {
        false
    }

    fn login_path(&self, _remote: &Url) -> Option<String> {
        None
    }

    fn login_parameters(&self, _remote: &Url) -> Option<Map<String, Value>> {
        None
    }

    fn decorate(&self, request: HttpRequest) -> HttpRequest {
        if request.basic_auth.is_some() {
            return request;
        }
        request.with_basic_auth(self.user.clone(), self.password.clone())
    }
}

/// Cookie login through `POST _session`.
///
/// Requests are not decorated; the session cookie set by the login response
/// is stored in the shared HTTP client.
#[derive(Clone)]
pub struct SessionAuthenticator {
    user: String,
    password: String,
    http_client: Option<Arc<dyn HttpClient>>,
}

impl SessionAuthenticator {
    /// Creates a session authenticator.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            http_client: None,
        }
    }

    /// Uses a dedicated HTTP client (and therefore cookie jar).
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }
}

impl fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("user", &self.user)
            .field("password", &"*****")
            .field("http_client", &self.http_client.is_some())
            .finish()
    }
}

impl Authenticator for SessionAuthenticator {
    fn http_client(&self) -> Option<Arc<dyn HttpClient>> {
        self.http_client.clone()
    }

    fn uses_session_login(&self) -> bool {
        true
    }

    fn login_path(&self, _remote: &Url) -> Option<String> {
        Some(SESSION_PATH.to_owned())
    }

    fn login_parameters(&self, _remote: &Url) -> Option<Map<String, Value>> {
        let mut params = Map::new();
        params.insert("name".into(), Value::String(self.user.clone()));
        params.insert("password".into(), Value::String(self.password.clone()));
        Some(params)
    }
}
