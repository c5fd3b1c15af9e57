//! Shared configuration for tidepool tools.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext),
//! and translation to `tidepool_core::SessionConfig`. The CLI layers its
//! global flags on top.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tidepool_core::{AuthCredentials, DEFAULT_NAMESPACE, SessionConfig};
use tidepool_rpc::ReconnectConfig;

/// Keyring service under which secrets are stored.
pub const KEYRING_SERVICE: &str = "tidepool";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' not found")]
    UnknownProfile { profile: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("cannot write config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error(transparent)]
    Figment(Box<figment::Error>),

    #[error("config file I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Named server profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Look up a profile, falling back to `default_profile`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, p)| (k.as_str(), p))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
            timeout: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "plain".into()
}
fn default_color() -> String {
    "auto".into()
}
fn default_timeout() -> u64 {
    30
}

/// How a profile authorizes after connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Stay anonymous.
    #[default]
    None,
    Token,
    Credentials,
}

/// A named server profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// WebSocket endpoint (e.g., "wss://live.example.com/rpc").
    pub url: String,

    /// Remote method namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub auth_mode: AuthMode,

    /// Token (plaintext, prefer keyring or env var).
    pub token: Option<String>,

    /// Environment variable name containing the token.
    pub token_env: Option<String>,

    pub username: Option<String>,

    /// Password (plaintext, prefer keyring).
    pub password: Option<String>,

    /// Override request timeout.
    pub timeout: Option<u64>,

    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

impl Profile {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: default_namespace(),
            auth_mode: AuthMode::None,
            token: None,
            token_env: None,
            username: None,
            password: None,
            timeout: None,
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Reconnect backoff, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Give up after this many attempts; unset retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: None,
        }
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.initial_delay_ms)),
            max_retries: settings.max_retries,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "tidepool", "tidepool").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("tidepool");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path`, with `TIDEPOOL_`-prefixed environment variables
/// layered on top (`TIDEPOOL_DEFAULTS__TIMEOUT=5`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("TIDEPOOL_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if it cannot be read.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to the canonical path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

fn keyring_lookup(profile_name: &str, secret: &str) -> Option<String> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/{secret}"))
        .ok()?
        .get_password()
        .ok()
}

/// Store a secret for a profile in the system keyring.
pub fn store_secret(profile_name: &str, secret: &str, value: &str) -> Result<(), ConfigError> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/{secret}"))
        .and_then(|entry| entry.set_password(value))
        .map_err(|e| ConfigError::Validation {
            field: "keyring".into(),
            reason: e.to_string(),
        })
}

/// First secret found in the environment, the keyring, or the plaintext
/// profile field, in that order.
fn lookup_secret(
    env_value: Option<String>,
    keyring: impl Fn(&str, &str) -> Option<String>,
    profile_name: &str,
    secret: &str,
    plaintext: Option<&String>,
) -> Result<SecretString, ConfigError> {
    env_value
        .or_else(|| keyring(profile_name, secret))
        .or_else(|| plaintext.cloned())
        .map(SecretString::from)
        .ok_or_else(|| ConfigError::NoCredentials {
            profile: profile_name.into(),
        })
}

fn resolve_token_with(
    profile: &Profile,
    profile_name: &str,
    keyring: impl Fn(&str, &str) -> Option<String>,
) -> Result<SecretString, ConfigError> {
    let from_env = profile
        .token_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    lookup_secret(from_env, keyring, profile_name, "token", profile.token.as_ref())
}

fn resolve_credentials_with(
    profile: &Profile,
    profile_name: &str,
    keyring: impl Fn(&str, &str) -> Option<String>,
) -> Result<(String, SecretString), ConfigError> {
    let Some(username) = profile
        .username
        .clone()
        .or_else(|| std::env::var("TIDEPOOL_USERNAME").ok())
    else {
        return Err(ConfigError::NoCredentials {
            profile: profile_name.into(),
        });
    };
    let password = lookup_secret(
        std::env::var("TIDEPOOL_PASSWORD").ok(),
        keyring,
        profile_name,
        "password",
        profile.password.as_ref(),
    )?;
    Ok((username, password))
}

fn resolve_auth_with(
    profile: &Profile,
    profile_name: &str,
    keyring: impl Fn(&str, &str) -> Option<String>,
) -> Result<Option<AuthCredentials>, ConfigError> {
    match profile.auth_mode {
        AuthMode::None => Ok(None),
        AuthMode::Token => {
            resolve_token_with(profile, profile_name, keyring).map(|t| Some(AuthCredentials::Token(t)))
        }
        AuthMode::Credentials => {
            let (username, password) = resolve_credentials_with(profile, profile_name, keyring)?;
            Ok(Some(AuthCredentials::Credentials { username, password }))
        }
    }
}

/// Resolve the credentials a profile authorizes with, if any.
pub fn resolve_auth(
    profile: &Profile,
    profile_name: &str,
) -> Result<Option<AuthCredentials>, ConfigError> {
    resolve_auth_with(profile, profile_name, keyring_lookup)
}

/// Build a `SessionConfig` from a profile, without flag overrides.
pub fn profile_to_session_config(
    profile: &Profile,
    profile_name: &str,
) -> Result<SessionConfig, ConfigError> {
    profile_to_session_config_with(profile, profile_name, resolve_auth(profile, profile_name)?)
}

/// Build a `SessionConfig` from a profile with already resolved
/// credentials.
pub fn profile_to_session_config_with(
    profile: &Profile,
    profile_name: &str,
    auth: Option<AuthCredentials>,
) -> Result<SessionConfig, ConfigError> {
    let url: url::Url = profile.url.parse().map_err(|_| ConfigError::Validation {
        field: "url".into(),
        reason: format!("invalid URL in profile '{profile_name}': {}", profile.url),
    })?;

    let mut config = SessionConfig::new(url);
    config.namespace.clone_from(&profile.namespace);
    config.auth = auth;
    config.reconnect = ReconnectConfig::from(&profile.reconnect);
    config.request_timeout = Duration::from_secs(profile.timeout.unwrap_or(default_timeout()));

    config.validate().map_err(|e| ConfigError::Validation {
        field: "profile".into(),
        reason: e.to_string(),
    })?;
    Ok(config)
}
