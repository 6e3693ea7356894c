//! # Realm Server
//!
//! Game world and link hub server.
//!
//! ## Usage
//!
//! ```bash
//! # Run a world with default settings
//! realm
//!
//! # Run with a custom config
//! REALM_CONFIG=/path/to/realm.toml realm
//!
//! # Run with environment variables
//! REALM_PORT=43594 REALM_HOST=0.0.0.0 realm
//! ```

mod config;
mod context;
mod http;
mod hub;
mod link;
mod metrics;
mod services;
mod store;
mod world;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Role;
use crate::context::Realm;
use crate::http::{AppState, Node};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realm=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        role = ?config.role,
        "Starting Realm server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    let realm = Realm::new(config)?;
    services::install(&realm)?;

    let node = match realm.config.role {
        Role::Hub => {
            let hub = hub::HubNode::new(realm.clone());
            hub.install();
            Node::Hub(hub)
        }
        Role::World => {
            let world = world::World::new(realm.clone()).await?;
            world.install();
            Node::World(world)
        }
    };
    realm.executor.start();

    let signal_realm = realm.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_realm.begin_shutdown();
        }
    });

    let state = Arc::new(AppState {
        realm: realm.clone(),
        node: node.clone(),
    });
    let http = tokio::spawn(http::serve(state, realm.config.http_addr()?));

    let outcome = match node {
        Node::Hub(hub) => hub.run().await,
        Node::World(world) => world.run().await,
    };

    realm.begin_shutdown();
    if let Err(e) = http.await? {
        tracing::warn!("HTTP endpoints failed: {}", e);
    }
    realm.finish_shutdown();

    outcome
}
