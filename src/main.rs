//! Per-rank broker process entry point: parses CLI flags, builds and
//! validates a [`fluxbroker::BrokerConfig`], initializes logging, and runs
//! the rank's router loop until interrupted.
//!
//! Exit codes (spec.md §6): 0 success, 1 usage/configuration error, 2+
//! initialization failure.

use clap::Parser;
use fluxbroker::overlay::OverlayRegistry;
use fluxbroker::{BrokerNode, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match fluxbroker::BrokerConfig::try_from(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fluxbroker: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(rank = config.rank.into_inner(), size = config.size.into_inner(), "starting broker rank");

    // Each OS process currently seeds its own overlay registry: the
    // bootstrap mechanism that would hand sibling ranks a shared transport
    // handle is out of scope (spec.md §1). This binary runs a single rank;
    // multi-rank sessions are assembled in-process in the integration tests.
    let registry = OverlayRegistry::new();
    let node = match BrokerNode::start(config, registry).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!(%e, "failed to start broker rank");
            std::process::exit(2);
        }
    };

    node.run().await;
}
