//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use tidepool_config::ConfigError;
use tidepool_core::{CoreError, QueryError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to server at {url}")]
    #[diagnostic(
        code(tidepool::connection_failed),
        help(
            "Check that the server is running and accepts WebSocket connections.\n\
             URL: {url}"
        )
    )]
    ConnectionFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Connection to the server was lost")]
    #[diagnostic(code(tidepool::disconnected))]
    Disconnected,

    // ── Authorization ────────────────────────────────────────────────
    #[error("Authorization failed: {message}")]
    #[diagnostic(
        code(tidepool::auth_failed),
        help("Verify the token or credentials of the active profile, or pass --token.")
    )]
    AuthFailed { message: String },

    #[error("No credentials configured for profile '{profile}'")]
    #[diagnostic(
        code(tidepool::no_credentials),
        help(
            "Set token_env or username in the profile, or set TIDEPOOL_TOKEN.\n\
             Secrets may also live in the system keyring (service \"tidepool\")."
        )
    )]
    NoCredentials { profile: String },

    // ── Query ────────────────────────────────────────────────────────
    #[error("Invalid query: {0}")]
    #[diagnostic(
        code(tidepool::invalid_query),
        help("Run: tidepool watch --help")
    )]
    Query(#[from] QueryError),

    #[error("Server error in {method}: {message}")]
    #[diagnostic(code(tidepool::remote))]
    Remote { method: String, message: String },

    #[error("{message}")]
    #[diagnostic(code(tidepool::invalid_state))]
    InvalidState { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(tidepool::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(tidepool::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: tidepool config init --server <URL>"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("No server configured")]
    #[diagnostic(
        code(tidepool::no_config),
        help(
            "Create a profile with: tidepool config init --server <URL>\n\
             Or pass --url. Expected config at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(tidepool::config))]
    Config(Box<figment::Error>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(tidepool::timeout),
        help("Increase timeout with --timeout or check server responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON for {field}: {source}")]
    #[diagnostic(code(tidepool::json))]
    Json {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Internal error: {0}")]
    #[diagnostic(code(tidepool::internal))]
    Internal(String),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. }
            | Self::Query(_)
            | Self::Json { .. }
            | Self::ProfileNotFound { .. }
            | Self::NoConfig { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

impl From<figment::Error> for CliError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed {
                url,
                source: reason.into(),
            },
            CoreError::AuthorizationFailed { message } => CliError::AuthFailed { message },
            CoreError::Disconnected | CoreError::Shutdown => CliError::Disconnected,
            CoreError::Timeout { timeout_secs } => CliError::Timeout {
                seconds: timeout_secs,
            },
            CoreError::Query(e) => CliError::Query(e),
            CoreError::InvalidState { message } => CliError::InvalidState { message },
            CoreError::MalformedEvent { event, reason } => CliError::Remote {
                method: event,
                message: reason,
            },
            CoreError::MalformedSnapshot { reason } => CliError::Remote {
                method: "liveQuery".into(),
                message: reason,
            },
            CoreError::Remote {
                method, message, ..
            } => CliError::Remote { method, message },
            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },
            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::UnknownProfile { profile } => CliError::ProfileNotFound {
                name: profile,
                available: String::new(),
            },
            ConfigError::NoCredentials { profile } => CliError::NoCredentials { profile },
            ConfigError::Serialization(e) => CliError::Internal(e.to_string()),
            ConfigError::Figment(e) => CliError::Config(e),
            ConfigError::Io(e) => CliError::Io(e),
        }
    }
}
