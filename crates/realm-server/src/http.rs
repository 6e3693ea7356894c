//! HTTP status endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::context::Realm;
use crate::hub::HubNode;
use crate::world::World;

/// The role this process runs.
#[derive(Clone)]
pub enum Node {
    Hub(Arc<HubNode>),
    World(Arc<World>),
}

/// Shared HTTP state.
pub struct AppState {
    pub realm: Arc<Realm>,
    pub node: Node,
}

/// Serve the status endpoints until shutdown.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let shutdown = state.realm.shutdown.clone();
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/worlds", get(worlds_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("HTTP endpoints listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(health(&state))
}

async fn worlds_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(worlds(&state))
}

fn health(state: &AppState) -> Value {
    json!({
        "status": if state.realm.shutdown.is_cancelled() { "stopping" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "role": state.realm.config.role,
        "lanes": state.realm.executor.stats(),
    })
}

fn worlds(state: &AppState) -> Value {
    match &state.node {
        Node::Hub(node) => {
            let worlds: Vec<Value> = node
                .hub()
                .sessions()
                .iter()
                .map(|session| {
                    let (game, lobby) = session.player_count();
                    json!({
                        "id": session.id(),
                        "kind": session.kind(),
                        "address": session.address(),
                        "transports": session.transport_count(),
                        "game_players": game,
                        "lobby_players": lobby,
                    })
                })
                .collect();
            json!({ "stats": node.hub().stats(), "worlds": worlds })
        }
        Node::World(world) => json!({
            "worlds": [{
                "id": world.id(),
                "kind": world.kind(),
                "address": state.realm.config.advertised_address(),
                "transports": world.link().connected(),
                "players": world.players().len(),
            }]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Role};
    use realm_core::LinkTransport;
    use realm_protocol::{Frame, PlayerShadow, WorldKind};

    struct Loopback;

    impl LinkTransport for Loopback {
        fn id(&self) -> u64 {
            1
        }

        fn send(&self, _frame: Frame) -> Result<(), realm_core::HubError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_health_reports_lanes() {
        let config = Config {
            role: Role::Hub,
            ..Config::default()
        };
        let realm = Realm::on_runtime(tokio::runtime::Handle::current(), config);
        let state = AppState {
            node: Node::Hub(HubNode::new(realm.clone())),
            realm,
        };

        let body = health(&state);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["role"], "hub");
        assert_eq!(body["lanes"].as_array().unwrap().len(), 7);

        state.realm.begin_shutdown();
        assert_eq!(health(&state)["status"], "stopping");
    }

    #[tokio::test]
    async fn test_worlds_lists_hub_sessions() {
        let realm = Realm::on_runtime(tokio::runtime::Handle::current(), Config::default());
        let node = HubNode::new(realm.clone());
        node.hub()
            .attach(3, WorldKind::Lobby, "10.0.0.3:43594", Arc::new(Loopback))
            .unwrap();
        node.hub()
            .register_player(&PlayerShadow::new("alice", 3, true))
            .unwrap();

        let state = AppState {
            node: Node::Hub(node),
            realm,
        };
        let body = worlds(&state);
        let world = &body["worlds"][0];
        assert_eq!(world["id"], 3);
        assert_eq!(world["kind"], "lobby");
        assert_eq!(world["lobby_players"], 1);
        assert_eq!(body["stats"]["worlds"], 1);
    }
}
