// ── Runtime session configuration ──
//
// These types describe *how* to reach a tidepool server. They carry
// credential data and connection tuning, but never touch disk.
// The CLI constructs a `SessionConfig` and hands it in.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tidepool_rpc::{ReconnectConfig, RpcClientConfig};
use url::Url;

use crate::error::CoreError;

/// Remote method namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "MR";

/// Credentials sent with `authorize`.
#[derive(Debug, Clone)]
pub enum AuthCredentials {
    /// Bearer-style token, sent as `{"token": ...}`.
    Token(SecretString),
    /// Sent as `{"username": ..., "password": ...}`.
    Credentials {
        username: String,
        password: SecretString,
    },
}

impl AuthCredentials {
    /// Positional arguments for the `authorize` call.
    pub fn to_args(&self) -> Vec<Value> {
        match self {
            Self::Token(token) => vec![json!({ "token": token.expose_secret() })],
            Self::Credentials { username, password } => vec![json!({
                "username": username,
                "password": password.expose_secret(),
            })],
        }
    }
}

/// Configuration for one session.
///
/// Built by the CLI, passed to [`Session::connect`](crate::Session::connect).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: Url,
    /// Prefix of every remote method path (`<namespace>.<model>.<method>`).
    pub namespace: String,
    /// Authorize right after connecting, and again after every reconnect.
    pub auth: Option<AuthCredentials>,
    pub reconnect: ReconnectConfig,
    pub request_timeout: Duration,
}

impl SessionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            auth: None,
            reconnect: ReconnectConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !matches!(self.url.scheme(), "ws" | "wss") {
            return Err(CoreError::Config {
                message: format!(
                    "server URL must use ws:// or wss://, got {}://",
                    self.url.scheme()
                ),
            });
        }
        if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace) {
            return Err(CoreError::Config {
                message: format!("invalid namespace '{}'", self.namespace),
            });
        }
        Ok(())
    }

    pub(crate) fn rpc_config(&self) -> RpcClientConfig {
        RpcClientConfig {
            reconnect: self.reconnect.clone(),
            request_timeout: self.request_timeout,
        }
    }
}
