#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use detailer_pwa::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "detailer-pwa")]
#[command(about = "Offline cache host and update coordinator for the detailer web app")]
#[command(version)]
struct Args {
    /// Path to config file (default: <config dir>/detailer-pwa/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Front the app origin as a caching proxy with the update flow under /__pwa/
    Host {
        /// Origin to front (overrides the config file)
        #[arg(long)]
        origin: Option<String>,

        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Development mode: no background update checks
        #[arg(long)]
        dev: bool,
    },
    /// Serve the public directory as the app origin
    Origin {
        /// Directory to serve (default: paths.public_dir from the config file)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> detailer_pwa::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_create(&config_path)?;
    log::debug!("Loaded config from {}", config_path.display());

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    match args.command {
        Command::Host { origin, port, dev } => {
            if let Some(origin) = origin {
                config.server.origin = origin;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.coordinator.dev_mode |= dev;
            detailer_pwa::server::run_host(config, token).await
        }
        Command::Origin { dir, host, port } => {
            let dir = dir.unwrap_or_else(|| config.paths.public_dir.clone());
            detailer_pwa::server::run_origin(dir, &host, port, token).await
        }
    }
}
