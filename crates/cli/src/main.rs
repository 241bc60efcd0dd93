use std::process::ExitCode;

use anyhow::{anyhow, Result};
use signoff_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) -> Result<()> {
    use signoff_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    // Command output owns stdout; events go to stderr.
    match config.logging.format {
        Compact => builder.compact().try_init(),
        Pretty => builder.pretty().try_init(),
        Json => builder.json().try_init(),
    }
    .map_err(|error| anyhow!("failed to initialize logging: {error}"))
}

fn main() -> Result<ExitCode> {
    // Commands report config problems themselves, so logging falls back to defaults.
    let config = AppConfig::load(LoadOptions::default()).unwrap_or_default();
    init_logging(&config)?;

    Ok(signoff_cli::run())
}
