//! Clap derive structures for the `tidepool` CLI.
//!
//! Defines the command tree, global flags, and shared value enums.

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// tidepool -- watch live queries from the command line
#[derive(Debug, Parser)]
#[command(
    name = "tidepool",
    version,
    about = "Watch live queries on a tidepool server",
    long_about = "Subscribes to live queries over a WebSocket RPC channel and prints\n\
        the materialized result followed by every change the server pushes.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Server profile to use
    #[arg(long, short = 'p', env = "TIDEPOOL_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Server WebSocket URL (overrides profile)
    #[arg(long, env = "TIDEPOOL_URL", global = true)]
    pub url: Option<String>,

    /// Remote method namespace (overrides profile)
    #[arg(long, env = "TIDEPOOL_NAMESPACE", global = true)]
    pub namespace: Option<String>,

    /// Authorization token (overrides profile credentials)
    #[arg(long, env = "TIDEPOOL_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Output format [default: from config, else plain]
    #[arg(long, short = 'o', env = "TIDEPOOL_OUTPUT", global = true)]
    pub output: Option<OutputFormat>,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Request timeout in seconds
    #[arg(long, env = "TIDEPOOL_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON, one document per line
    JsonCompact,
    /// Human-readable event log
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a live query and stream its changes
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// List the models the server exposes
    Models,

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Watch ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Model (collection) name
    pub model: String,

    /// Find conditions as a JSON object
    #[arg(long)]
    pub query: Option<String>,

    /// Full query as a JSON array of {"method", "args"} calls
    #[arg(
        long,
        conflicts_with_all = ["query", "limit", "skip", "sort", "count", "distinct", "find_one", "select", "populate"]
    )]
    pub raw: Option<String>,

    /// Keep only the first N documents
    #[arg(long, short = 'l')]
    pub limit: Option<u64>,

    /// Skip the first N documents
    #[arg(long)]
    pub skip: Option<u64>,

    /// Sort specification (e.g. "-created title")
    #[arg(long)]
    pub sort: Option<String>,

    /// Watch the number of matching documents
    #[arg(long, conflicts_with_all = ["distinct", "find_one"])]
    pub count: bool,

    /// Watch the distinct values of a field
    #[arg(long, value_name = "FIELD", conflicts_with = "find_one")]
    pub distinct: Option<String>,

    /// Watch the first matching document only
    #[arg(long)]
    pub find_one: bool,

    /// Fields to include
    #[arg(long)]
    pub select: Option<String>,

    /// Reference path to populate
    #[arg(long)]
    pub populate: Option<String>,

    /// Print the initial result and exit
    #[arg(long)]
    pub once: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create or replace a profile in the config file
    Init(InitArgs),

    /// Display the configuration with secrets masked
    Show,

    /// Print the config file location
    Path,

    /// Store a profile secret in the system keyring
    SetSecret(SetSecretArgs),
}

#[derive(Debug, Args)]
pub struct SetSecretArgs {
    /// Which secret to store
    pub kind: SecretKind,

    /// Read the value from stdin instead of prompting
    #[arg(long)]
    pub stdin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SecretKind {
    /// Authorization token
    Token,
    /// Password for credential authorization
    Password,
}

impl SecretKind {
    /// Keyring entry suffix, matching what credential resolution reads.
    pub fn key(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Password => "password",
        }
    }
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Server WebSocket URL (ws:// or wss://)
    #[arg(long = "server", value_name = "URL")]
    pub server: String,

    /// How the profile authorizes after connecting
    #[arg(long, default_value = "none")]
    pub auth_mode: AuthModeArg,

    /// Environment variable holding the token
    #[arg(long)]
    pub token_env: Option<String>,

    /// Username for credential authorization
    #[arg(long)]
    pub username: Option<String>,

    /// Replace the profile if it already exists
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthModeArg {
    /// Stay anonymous
    None,
    /// Authorize with a token
    Token,
    /// Authorize with username and password
    Credentials,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
