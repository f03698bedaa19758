// src/main.rs

//! The main entry point for the quorumd watchdog process.

use anyhow::Result;
use quorumd::config::WatchdogConfig;
use std::env;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("quorumd version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("watchdog.toml");

    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,quorumd::watchdog=debug".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    let config = match WatchdogConfig::from_file(config_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = quorumd::watchdog::run(config).await {
        error!("watchdog runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
