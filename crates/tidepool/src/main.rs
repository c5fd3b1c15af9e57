mod cli;
mod commands;
mod config;
mod error;
mod output;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tidepool_core::Session;

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;
use crate::output::OutputOpts;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let cfg = config::load_config_or_default();
    let out = OutputOpts {
        format: config::output_format(&cli.global, &cfg),
        color: output::should_color(cli.global.color),
        quiet: cli.global.quiet,
    };

    match cli.command {
        // No server connection needed
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global, out),

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "tidepool", &mut std::io::stdout());
            Ok(())
        }

        Command::Watch(args) => {
            // Reject malformed queries before touching the network.
            let query = commands::watch::build_query(&args)?;
            let session = connect(&cli.global, &cfg).await?;
            let result = commands::watch::handle(&session, &args, query, out).await;
            session.shutdown();
            result
        }

        Command::Models => {
            let session = connect(&cli.global, &cfg).await?;
            let result = commands::models::handle(&session, out).await;
            session.shutdown();
            result
        }
    }
}

async fn connect(global: &GlobalOpts, cfg: &config::Config) -> Result<Session, CliError> {
    let session_config = config::resolve_session_config(global, cfg)?;
    tracing::debug!(url = %session_config.url, namespace = %session_config.namespace, "connecting");
    Ok(Session::connect(session_config).await?)
}
