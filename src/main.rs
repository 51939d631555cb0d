//! querygate - standalone gateway over the bundled SQLite store.

use querygate::config::ServerConfig;
use querygate::db::Store;
use querygate::web::{Api, Server};

use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("querygate=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting querygate on {}...", cfg.listen_address);
    tracing::info!("Using database at {}", cfg.db_path);

    std::fs::create_dir_all(&cfg.data_dir)?;
    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");
    if cfg.agent_mode {
        tracing::info!("Agent mode: storage endpoints are disabled");
    }

    let api = Api::new(cfg, store);
    let server = Server::new(api)?;
    server.start().await?;

    Ok(())
}
