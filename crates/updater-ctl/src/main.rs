//! updater-ctl entry point

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use updater_core::UpdaterConfig;
use updater_ctl::{Cli, ExitCode};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Config error: {e:#}");
            eprintln!("Using default configuration.");
            UpdaterConfig::default()
        }
    };

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.execute_with_config(config).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            match e.downcast_ref::<updater_core::UpdateError>() {
                Some(error) => ExitCode::from(error).to_exit_code(),
                None => ExitCode::GeneralError.to_exit_code(),
            }
        }
    }
}
