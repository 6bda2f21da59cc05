//! HTTP Cache - forwarding cache with access control
//!
//! Serves repeated requests from the cache and forwards the rest.

use std::io::Read;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use http_cache::{
    cache::KeyDeriver,
    cli::{Cli, Command},
    config::Config,
    ingress::CacheServer,
    message::Request,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Key { ref file }) => run_key(cli.config.as_deref(), file),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Print the key the pipeline would derive for a request file
fn run_key(config: Option<&Path>, file: &Path) -> ExitCode {
    let config = match Config::load(config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut raw = String::new();
    let read = if file == Path::new("-") {
        std::io::stdin().read_to_string(&mut raw).map(|_| ())
    } else {
        std::fs::read_to_string(file).map(|contents| raw = contents)
    };
    if let Err(e) = read {
        eprintln!("Failed to read {}: {e}", file.display());
        return ExitCode::FAILURE;
    }

    let request: Request = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Not a valid request: {e}");
            return ExitCode::FAILURE;
        }
    };

    match KeyDeriver::from_config(&config.cache).derive(&request) {
        Ok(key) => {
            println!("{key}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Cannot derive key: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if cli.no_queue {
                config.queue.enabled = false;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        backend = ?config.cache.backend,
        queue = config.queue.enabled,
        "Starting HTTP cache"
    );

    if let Err(e) = CacheServer::new(config).run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
