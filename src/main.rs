use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use plural_proxy::{Config, Worker};

/// Proxy worker for plural Discord accounts
#[derive(Parser)]
#[command(name = "plural-proxy", version, about)]
struct Cli {
    /// Path to a TOML config file (defaults to the platform config dir)
    #[arg(short, long, env = "PLURAL_CONFIG")]
    config: Option<PathBuf>,

    /// Health check port, overriding the config
    #[arg(long, env = "PLURAL_HEALTH_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = match cli.verbose {
        0 => "info,plural_proxy=info",
        1 => "info,plural_proxy=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!(config = ?cli.config, port = ?cli.port, "starting plural proxy worker");

    let config = Config::load_with_options(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    let worker = Worker::new(config, cli.port)?;
    worker.run().await?;

    Ok(())
}
