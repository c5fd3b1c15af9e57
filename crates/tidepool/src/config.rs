//! CLI configuration: thin wrapper around `tidepool_config`.
//!
//! Adds resolution that respects `GlobalOpts` flag overrides
//! (--url, --namespace, --token, --timeout).

use clap::ValueEnum;
use secrecy::SecretString;

use tidepool_core::{AuthCredentials, SessionConfig};

use crate::cli::{GlobalOpts, OutputFormat};
use crate::error::CliError;

pub use tidepool_config::{
    AuthMode, Config, Profile, config_path, load_config_or_default, profile_to_session_config_with,
    resolve_auth, save_config, store_secret,
};

/// Resolve the active profile name from flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// `--output`, else the config default, else plain.
pub fn output_format(global: &GlobalOpts, config: &Config) -> OutputFormat {
    global.output.unwrap_or_else(|| {
        OutputFormat::from_str(&config.defaults.output, true).unwrap_or(OutputFormat::Plain)
    })
}

/// Build a `SessionConfig` from the config file, profile, and flag
/// overrides. Flags take priority over profile values.
pub fn resolve_session_config(
    global: &GlobalOpts,
    config: &Config,
) -> Result<SessionConfig, CliError> {
    let profile_name = active_profile_name(global, config);

    let mut profile = match config.profiles.get(&profile_name) {
        Some(profile) => profile.clone(),
        None if global.profile.is_some() => {
            return Err(CliError::ProfileNotFound {
                name: profile_name,
                available: config.profiles.keys().cloned().collect::<Vec<_>>().join(", "),
            });
        }
        // No profile: flags and env vars alone must name a server.
        None => {
            let url = global.url.clone().ok_or_else(|| CliError::NoConfig {
                path: config_path().display().to_string(),
            })?;
            Profile::new(url)
        }
    };

    if let Some(ref url) = global.url {
        profile.url.clone_from(url);
    }
    if let Some(ref namespace) = global.namespace {
        profile.namespace.clone_from(namespace);
    }
    profile.timeout = global
        .timeout
        .or(profile.timeout)
        .or(Some(config.defaults.timeout));

    let auth = match global.token {
        Some(ref token) => Some(AuthCredentials::Token(SecretString::from(token.clone()))),
        None => resolve_auth(&profile, &profile_name)?,
    };

    Ok(profile_to_session_config_with(&profile, &profile_name, auth)?)
}
