//! Entrypoint for the duplication mill command line.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use clap::Parser;
use observability_deps::tracing::{error, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod registry;

#[derive(Debug, clap::Parser)]
#[clap(
    name = "dupmill",
    about = "Cross-provider object duplication mill",
    long_about = "Continuously reconciles content between pairs of object \
    storage backends, per tenant, space and replication policy.\n\nThe \
    configuration options below can be set either with the command line \
    flags or with the specified environment variable. If there is a file \
    named '.env' in the current working directory, it is sourced before \
    loading the configuration; DUPMILL_CONFIG may point at an additional \
    property file to source.

Configuration is loaded from the following sources (highest precedence first):
        - command line arguments
        - user set environment variables
        - property file / .env file contents
        - pre-configured default values"
)]
struct Config {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Enumerate content per policy and fill the duplication task queue.
    Produce(commands::produce::Config),

    /// Consume duplication tasks and reconcile destinations with sources.
    Work(commands::work::Config),
}

#[tokio::main]
async fn main() {
    // source the conventional .env first, then the operator-named property
    // file, so explicit environment variables win over both
    dotenvy::dotenv().ok();
    if let Ok(path) = std::env::var("DUPMILL_CONFIG") {
        if let Err(e) = dotenvy::from_path(&path) {
            eprintln!("could not read property file {path}: {e}");
            std::process::exit(1);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    let result = match config.command {
        Command::Produce(config) => commands::produce::command(config)
            .await
            .map_err(|e| e.to_string()),
        Command::Work(config) => commands::work::command(config)
            .await
            .map_err(|e| e.to_string()),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

/// Install a ctrl-c handler that cancels the returned token.
fn shutdown_token() -> tokio_util::sync::CancellationToken {
    let token = tokio_util::sync::CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, shutting down after the current slice");
                signal_token.cancel();
            }
            Err(e) => warn!(error = %e, "could not install interrupt handler"),
        }
    });
    token
}
