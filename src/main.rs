#[path = "log.rs"]
mod app_log;
mod cli;
mod config;
mod overlay;
mod rendezvous;
mod router;
mod state;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use cli::Cli;
use config::Config;
use overlay::OverlayController;
use rendezvous::RendezvousClient;
use state::SharedState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    if !Path::new(&config_path).exists() {
        bail!("configuration file not found: {}", config_path);
    }

    let config = Config::load(&config_path)?;
    config.validate()?;

    app_log::setup_logger()?;

    let state = SharedState::new(config)?;

    // Default subscriber: print incoming chat messages to the console.
    state.router().subscribe(|src, payload, _delivery| {
        println!("[{}] {}", src, payload);
        Ok(())
    });

    let rendezvous = Arc::new(RendezvousClient::new(&state.config));
    rendezvous
        .register(&state)
        .await
        .context("initial registration with the rendezvous directory failed")?;

    let controller = OverlayController::new(state.clone(), rendezvous.clone());
    controller.clone().start()?;

    let shell = Cli::new(state.clone(), controller.clone(), rendezvous);
    tokio::select! {
        result = shell.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            println!();
            log::info!("interrupted, shutting down");
        }
    }

    controller.shutdown().await;
    Ok(())
}
