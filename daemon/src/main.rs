use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};
use std::time::Duration;

use crate::cli::Cli;
use crate::settings::SettingsHandle;
use crate::shutdown::Shutdown;

mod cli;
mod relay;
mod settings;
mod shutdown;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        args.log_level.into(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;
    log_panics::init();

    if args.list {
        relay::list_devices();
        return Ok(());
    }

    info!("Starting UAC Relay v{}", VERSION);
    let settings = SettingsHandle::load(args.config.clone()).await?;
    let handle = relay::acquire_device(&args)?;

    let shutdown = Shutdown::new();
    tokio::spawn(relay::await_ctrl_c(shutdown.clone()));
    if let Some(seconds) = args.duration {
        tokio::spawn(relay::stop_after(
            Duration::from_secs(seconds),
            shutdown.clone(),
        ));
    }

    relay::run(&args, &settings, handle, shutdown).await?;
    info!("Relay stopped");
    Ok(())
}
