// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use revd::config::RevdConfig;
use revd::AppContext;
use tracing::info;

#[derive(Parser)]
#[command(name = "revd", about = "revd — AI diff review daemon", version)]
struct Args {
    /// REST API server port
    #[arg(long, env = "REVD_PORT")]
    port: Option<u16>,

    /// Data directory for saved reviews and config.toml
    #[arg(long, env = "REVD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "REVD_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RevdConfig::new(args.port, args.data_dir, args.log);

    // Init once — must happen before any tracing calls.
    setup_logging(&config.log, &config.log_format);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("cannot create data dir {}", config.data_dir.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        port = config.port,
        "starting revd"
    );
    let ctx = Arc::new(AppContext::new(config)?);
    revd::rest::start_rest_server(ctx).await
}

/// Initialize the tracing subscriber.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
fn setup_logging(log_level: &str, log_format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
