use thiserror::Error;

/// Top-level error type for the `tidepool-rpc` crate.
///
/// Covers connection setup, framing, request correlation and errors
/// reported by the remote end. `tidepool-core` maps these into its own
/// domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The transport dropped while the request was in flight.
    #[error("Transport disconnected before a response arrived")]
    Disconnected,

    /// The client was shut down; no further calls are possible.
    #[error("RPC client has been shut down")]
    Shutdown,

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request '{method}' timed out after {timeout_secs}s")]
    Timeout { method: String, timeout_secs: u64 },

    // ── Remote ──────────────────────────────────────────────────────
    /// The remote method responded with an error payload.
    #[error("Remote error in '{method}': {message}")]
    Remote {
        method: String,
        message: String,
        code: Option<String>,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// A frame could not be encoded or decoded.
    #[error("Malformed frame: {message}")]
    Frame { message: String, body: String },
}

impl Error {
    /// Returns `true` if retrying after a reconnect might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_)
                | Self::WebSocketClosed { .. }
                | Self::Disconnected
                | Self::Timeout { .. }
        )
    }

    /// Extract the remote error code, if available.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
