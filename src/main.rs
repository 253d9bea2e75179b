//! devchain orchestrator entry point.
//!
//! Exit codes: 0 on success, 1 on fatal startup error, 2 on
//! environment validation failure.

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use devchain::app::App;
use devchain::config::OrchestratorConfig;

#[derive(Parser)]
#[command(
    name = "devchain",
    about = "Local-first orchestrator for AI coding agents",
    version
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "devchain=info",
        1 => "devchain=debug",
        _ => "devchain=trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("environment validation failed: {err}");
            std::process::exit(2);
        }
    };

    let app = match App::build(config).await {
        Ok(app) => app,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = app.serve().await {
        error!("fatal: {err:#}");
        std::process::exit(1);
    }
}
