mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use savor_api::auth::{AppState, AppStateInner};
use savor_realtime::Hub;

use crate::config::Config;

const DEFAULT_LOG_FILTER: &str =
    "savor_server=debug,savor_api=debug,savor_realtime=debug,savor_db=debug,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database and storage
    let db = savor_db::Database::open(&config.db_path)?;
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let state: AppState = Arc::new(AppStateInner {
        db,
        hub: Hub::new(),
        jwt_secret: config.jwt_secret,
        storage_dir: config.storage_dir,
    });

    let app = savor_api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Savor backend listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Savor backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_names_this_crate() {
        let target = module_path!().split("::").next().unwrap();
        assert!(
            DEFAULT_LOG_FILTER
                .split(',')
                .any(|directive| directive == format!("{target}=debug"))
        );
        tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).unwrap();
    }
}
