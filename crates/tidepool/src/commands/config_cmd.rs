//! Config subcommand handlers.

use std::io::BufRead;

use tracing::info;

use crate::cli::{
    AuthModeArg, ConfigArgs, ConfigCommand, GlobalOpts, InitArgs, OutputFormat, SecretKind,
    SetSecretArgs,
};
use crate::config::{self, AuthMode, Config, Profile};
use crate::error::CliError;
use crate::output::{self, OutputOpts};

const MASK: &str = "****";

/// Copy of the config with plaintext secrets masked.
fn redacted(cfg: &Config) -> Config {
    let mut cfg = cfg.clone();
    for profile in cfg.profiles.values_mut() {
        if profile.token.is_some() {
            profile.token = Some(MASK.into());
        }
        if profile.password.is_some() {
            profile.password = Some(MASK.into());
        }
    }
    cfg
}

fn show(cfg: &Config, out: OutputOpts) -> Result<(), CliError> {
    let cfg = redacted(cfg);
    let rendered = match out.format {
        OutputFormat::Plain => {
            toml::to_string_pretty(&cfg).map_err(|e| CliError::Internal(e.to_string()))?
        }
        format => {
            let value = serde_json::to_value(&cfg).map_err(|source| CliError::Json {
                field: "config".into(),
                source,
            })?;
            output::render_value(format, &value)
        }
    };
    out.print(rendered.trim_end());
    Ok(())
}

fn init(
    args: InitArgs,
    global: &GlobalOpts,
    mut cfg: Config,
    out: OutputOpts,
) -> Result<(), CliError> {
    let name = global.profile.clone().unwrap_or_else(|| "default".into());
    if cfg.profiles.contains_key(&name) && !args.force {
        return Err(CliError::Validation {
            field: "profile".into(),
            reason: format!("profile '{name}' already exists (pass --force to replace it)"),
        });
    }

    let mut profile = Profile::new(args.server);
    if let Some(ref namespace) = global.namespace {
        profile.namespace.clone_from(namespace);
    }
    profile.auth_mode = match args.auth_mode {
        AuthModeArg::None => AuthMode::None,
        AuthModeArg::Token => AuthMode::Token,
        AuthModeArg::Credentials => AuthMode::Credentials,
    };
    profile.token_env = args.token_env;
    profile.username = args.username;
    profile.timeout = global.timeout;

    // Credentials resolve at connect time; only the shape is checked here.
    config::profile_to_session_config_with(&profile, &name, None)?;

    cfg.profiles.insert(name.clone(), profile);
    let default_missing = cfg
        .default_profile
        .as_ref()
        .is_none_or(|default| !cfg.profiles.contains_key(default));
    if default_missing {
        cfg.default_profile = Some(name.clone());
    }

    let path = config::save_config(&cfg)?;
    info!(profile = %name, path = %path.display(), "profile saved");
    out.print(&path.display().to_string());
    Ok(())
}

/// Name of the profile a secret is stored for. It must already exist so
/// the secret is not orphaned in the keyring.
fn secret_profile(global: &GlobalOpts, cfg: &Config) -> Result<String, CliError> {
    let name = config::active_profile_name(global, cfg);
    if cfg.profiles.contains_key(&name) {
        return Ok(name);
    }
    let mut available: Vec<_> = cfg.profiles.keys().cloned().collect();
    available.sort();
    Err(CliError::ProfileNotFound {
        name,
        available: if available.is_empty() {
            "(none)".into()
        } else {
            available.join(", ")
        },
    })
}

fn read_secret(kind: SecretKind, from_stdin: bool) -> Result<String, CliError> {
    let secret = if from_stdin {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        line.trim_end_matches(['\r', '\n']).to_owned()
    } else {
        let label = match kind {
            SecretKind::Token => "Token: ",
            SecretKind::Password => "Password: ",
        };
        rpassword::prompt_password(label)?
    };
    if secret.is_empty() {
        return Err(CliError::Validation {
            field: "secret".into(),
            reason: "value cannot be empty".into(),
        });
    }
    Ok(secret)
}

fn set_secret(
    args: &SetSecretArgs,
    global: &GlobalOpts,
    cfg: &Config,
    out: OutputOpts,
) -> Result<(), CliError> {
    let name = secret_profile(global, cfg)?;
    let secret = read_secret(args.kind, args.stdin)?;
    config::store_secret(&name, args.kind.key(), &secret)?;
    info!(profile = %name, secret = args.kind.key(), "secret stored in keyring");
    out.print(&format!(
        "Stored {} for profile '{name}' in the system keyring",
        args.kind.key()
    ));
    Ok(())
}

pub fn handle(args: ConfigArgs, global: &GlobalOpts, out: OutputOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            out.print(&config::config_path().display().to_string());
            Ok(())
        }
        ConfigCommand::Show => show(&config::load_config_or_default(), out),
        ConfigCommand::Init(init_args) => {
            init(init_args, global, config::load_config_or_default(), out)
        }
        ConfigCommand::SetSecret(secret_args) => {
            set_secret(&secret_args, global, &config::load_config_or_default(), out)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_only_present_secrets() {
        let mut cfg = Config::default();
        let mut with_secrets = Profile::new("ws://localhost:3000");
        with_secrets.token = Some("t0ken".into());
        with_secrets.password = Some("hunter2".into());
        cfg.profiles.insert("a".into(), with_secrets);
        cfg.profiles.insert("b".into(), Profile::new("ws://localhost:3001"));

        let masked = redacted(&cfg);
        assert_eq!(masked.profiles["a"].token.as_deref(), Some(MASK));
        assert_eq!(masked.profiles["a"].password.as_deref(), Some(MASK));
        assert_eq!(masked.profiles["b"].token, None);
        assert_eq!(cfg.profiles["a"].token.as_deref(), Some("t0ken"));
    }

    #[test]
    fn secrets_need_an_existing_profile() {
        use clap::Parser;

        let cli = crate::cli::Cli::try_parse_from([
            "tidepool", "-p", "prod", "config", "set-secret", "token",
        ])
        .unwrap();
        let mut cfg = Config::default();
        cfg.profiles.insert("staging".into(), Profile::new("ws://localhost:3000"));

        let err = secret_profile(&cli.global, &cfg).unwrap_err();
        assert!(matches!(
            err,
            CliError::ProfileNotFound { ref name, ref available }
                if name == "prod" && available == "staging"
        ));

        cfg.profiles.insert("prod".into(), Profile::new("wss://live.example.com"));
        assert_eq!(secret_profile(&cli.global, &cfg).unwrap(), "prod");
    }

    #[test]
    fn secret_kinds_match_credential_lookup_keys() {
        assert_eq!(SecretKind::Token.key(), "token");
        assert_eq!(SecretKind::Password.key(), "password");
    }
}
