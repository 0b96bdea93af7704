//! `rproxy` — binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from `RPROXY_*` environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Build TLS bundles, bind the listener and run the accept loop until a
//!    fatal error or Ctrl-C.

use anyhow::{Context, Result};
use rproxy::config::Config;
use rproxy::{telemetry, ProxyServer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        eprintln!("ERROR: rproxy configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;

    // -----------------------------------------------------------------------
    // 3. Proxy
    // -----------------------------------------------------------------------
    let proxy_config = cfg.into_proxy_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %proxy_config.listen,
        backend = %proxy_config.backend,
        "rproxy starting"
    );

    let proxy = ProxyServer::new(proxy_config)
        .bind()
        .await
        .context("failed to start rproxy")?;

    tokio::select! {
        res = proxy.serve() => res.context("rproxy accept loop stopped")?,
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }
    Ok(())
}
