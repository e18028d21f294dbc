use anyhow::Result;
use clap::Parser;
use pebble_feel::domain::settings::SettingsService;
use pebble_feel::infrastructure::logging;
use tracing::info;

mod presentation;

use presentation::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new()?,
    };

    // Keep the guard alive so file logs get flushed on exit
    let _log_guard = logging::init_logger(&settings.get().log_settings, cli.log_level.as_deref())?;
    info!("Settings loaded from {}", settings.path().display());

    presentation::cli::run(cli, settings).await
}
