/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Standalone gateway daemon: binds a TCP listener and runs a [`Server`]
//! until interrupted.

use std::env;
use std::sync::Arc;

use async_std::net::TcpListener;
use futures_channel::oneshot;
use gateway::config::GatewayConfig;
use gateway::server::Server;
use gateway::storage::InMemoryStorage;
use tracing_subscriber::EnvFilter;

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let bind_addr = env::var("DNY_GATEWAY_BIND").unwrap_or_else(|_| "0.0.0.0:7900".to_string());
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "dny-gateway listening");

    let config = GatewayConfig::default();
    let storage: Arc<dyn gateway::storage::Storage> = Arc::new(InMemoryStorage::new());
    let server = Arc::new(Server::build(config, Some(storage)));

    // No signal handling here: the process runs until killed. `Server::run`'s
    // shutdown channel exists for embedders that want a graceful stop;
    // `_shutdown_tx` simply outlives `run` so this binary never triggers it.
    let (_shutdown_tx, shutdown_rx) = oneshot::channel();

    server.run(listener, shutdown_rx).await;
    Ok(())
}
