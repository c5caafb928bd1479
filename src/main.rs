use anyhow::Result;
use clap::Parser;
use rigd::cli::{self, Commands};
use rigd::commands;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Only use colors when outputting to a TTY (not when piped to a log file)
    let use_color = atty::is(atty::Stream::Stdout);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(true)
        .with_ansi(use_color)
        .init();

    let result = match cli.cmd {
        Commands::Serve(args) => commands::cmd_serve(args).await,
        Commands::Preflight(args) => commands::cmd_preflight(args).await,
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
