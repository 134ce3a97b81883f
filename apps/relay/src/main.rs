//! Toasty relay entry point.

mod config;

use tracing_subscriber::EnvFilter;

use toasty_relay_server::RelayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,toasty=debug")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting Toasty relay");

    let relay_config = match config::RelayConfig::load() {
        Ok(c) => {
            tracing::info!(path = %config::config_path().display(), "configuration loaded");
            c
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            config::RelayConfig::default()
        }
    };

    let server = RelayServer::new(relay_config.server_config());
    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutting down");
            server.shutdown();
            runner.await??;
        }
        res = &mut runner => res??,
    }

    Ok(())
}
