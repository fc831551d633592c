//! Notification Dispatcher Entry Point

use clap::Parser;
use eyre::Result;
use notify_dispatcher::{cli::Cli, telemetry::install_color_eyre};

#[tokio::main]
async fn main() -> Result<()> {
    // Install color-eyre first for colored error output
    install_color_eyre();

    let cli = Cli::parse();
    notify_dispatcher::run(cli).await
}
