//! tickrelay entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Real-time price feed relay
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via TICKRELAY_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection
    tickrelay_ws::init_crypto();

    let args = Args::parse();

    tickrelay_telemetry::init_logging()?;

    info!("Starting tickrelay v{}", env!("CARGO_PKG_VERSION"));

    let config = tickrelay_app::AppConfig::load(args.config.as_deref())?;
    info!(
        feed_url = %config.feed.url,
        endpoint = %config.dispatch.endpoint,
        watched = config.symbols.watched.len(),
        "Configuration loaded"
    );

    tickrelay_app::Application::new(config)?.run().await?;

    Ok(())
}
