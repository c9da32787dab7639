//! pacer - operational tooling for the crawl pacing controller.
//!
//! Validates controller configuration and replays recorded request traces
//! through the controller to see how it would have paced them.

mod cli;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // PACER_* overrides and RUST_LOG may come from a .env in the working directory.
    let _ = dotenvy::dotenv();

    let default_filter = if cli::is_verbose() {
        "crawl_pacer=debug,pacer=debug"
    } else {
        "crawl_pacer=info,pacer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        // stdout carries the replay JSON.
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    cli::run().await
}
