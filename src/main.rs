//! Binary entry point for clusterboot.
//!
//! The runtime logic lives in `clusterboot::app`, so this binary only sets up
//! diagnostics and delegates to the shared library code.

use anyhow::Result;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    clusterboot::app::run().await
}
