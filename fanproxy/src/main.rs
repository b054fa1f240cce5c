//! # Fanproxy Entry Point
//!
//! The `fanproxy` executable has two roles:
//!
//! 1. **`serve`**: runs a proxy node. Calls carrying `targets` metadata are fanned out to the
//!    member nodes and their replies aggregated. Everything else is served by the local services.
//! 2. **`call`**: a JSON client for calling methods through a proxy node.
mod call;
mod cli;
mod serve;

use clap::Parser;
use cli::{Cli, Commands};
use std::process;

#[tokio::main]
async fn main() {
    // Initialise tracing (default: info; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Cli) -> anyhow::Result<()> {
    match args.command {
        Commands::Serve { config } => serve::run(config.as_deref()).await,
        Commands::Call {
            url,
            endpoint,
            body,
            targets,
            headers,
            file_descriptor_set,
            tls,
        } => {
            call::run(call::CallArgs {
                url,
                endpoint,
                body,
                targets,
                headers,
                file_descriptor_set,
                tls,
            })
            .await
        }
    }
}
