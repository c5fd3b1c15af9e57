// ── Core error types ──
//
// User-facing errors from tidepool-core. Consumers never see raw frame
// or socket failures; the `From<tidepool_rpc::Error>` impl translates
// transport-layer errors into domain-appropriate variants.

use thiserror::Error;

use crate::query::QueryError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to server at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authorization failed: {message}")]
    AuthorizationFailed { message: String },

    #[error("Server disconnected")]
    Disconnected,

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Session has been shut down")]
    Shutdown,

    // ── Query errors ─────────────────────────────────────────────────
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Malformed {event} event: {reason}")]
    MalformedEvent { event: String, reason: String },

    #[error("Malformed query snapshot: {reason}")]
    MalformedSnapshot { reason: String },

    // ── Remote errors (wrapped, not exposed raw) ─────────────────────
    #[error("Remote error in {method}: {message}")]
    Remote {
        method: String,
        message: String,
        /// Server-supplied error code, when present.
        code: Option<String>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event: event.into(),
            reason: reason.into(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<tidepool_rpc::Error> for CoreError {
    fn from(err: tidepool_rpc::Error) -> Self {
        match err {
            tidepool_rpc::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            tidepool_rpc::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            tidepool_rpc::Error::Disconnected => CoreError::Disconnected,
            tidepool_rpc::Error::Shutdown => CoreError::Shutdown,
            tidepool_rpc::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            tidepool_rpc::Error::Timeout { timeout_secs, .. } => {
                CoreError::Timeout { timeout_secs }
            }
            tidepool_rpc::Error::Remote {
                method,
                message,
                code,
            } => CoreError::Remote {
                method,
                message,
                code,
            },
            tidepool_rpc::Error::Frame { message, body: _ } => {
                CoreError::Internal(format!("Frame error: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_keeps_code() {
        let err: CoreError = tidepool_rpc::Error::Remote {
            method: "MR.task.liveQuery".into(),
            message: "not permitted".into(),
            code: Some("E_ACL".into()),
        }
        .into();

        match err {
            CoreError::Remote { method, code, .. } => {
                assert_eq!(method, "MR.task.liveQuery");
                assert_eq!(code.as_deref(), Some("E_ACL"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn disconnect_maps_to_domain_variant() {
        let err: CoreError = tidepool_rpc::Error::Disconnected.into();
        assert!(matches!(err, CoreError::Disconnected));
        assert_eq!(err.to_string(), "Server disconnected");
    }
}
