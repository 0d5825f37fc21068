// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-node relay binary backed by the in-memory store.

use std::sync::Arc;

use tracing::info;

use config_relay::{http, ConfigRelay, MemoryStore, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "config_relay=info".into()),
        )
        .init();

    let config: ServiceConfig = match std::env::var("CONFIG_RELAY_CONFIG") {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        Err(_) => ServiceConfig::default(),
    };

    let store = Arc::new(MemoryStore::new());
    let relay = Arc::new(ConfigRelay::new(store, config.clone()).await?);
    relay.start().await?;

    let app = http::router(Arc::clone(&relay));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    relay.shutdown();
    Ok(())
}
