use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fixip::{server, Settings};

/// Real client address recovery behind trusted load balancers
#[derive(Debug, Parser)]
#[command(name = "fixip", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "fixip.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let scopes = match Settings::load(&args.config).and_then(|settings| settings.scopes()) {
        Ok(scopes) => scopes,
        Err(e) => {
            error!("{}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        info!("{}: configuration OK ({} listeners)", args.config.display(), scopes.len());
        return ExitCode::SUCCESS;
    }

    info!("{} started", server::SERVER_NAME.replace('/', " "));

    tokio::select! {
        result = server::run(scopes) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}
