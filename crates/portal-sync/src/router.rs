//! Proxy request handling: relays between backend servers and two-phase
//! teleport handoff.
//!
//! A relay is forwarded unchanged to the connection registered under its
//! destination, and the destination's response is passed straight back.
//!
//! A teleport first asks the destination server to get ready for the player
//! and only after it acknowledges moves the player's session there:
//!
//! ```text
//! AwaitingDestinationReady --ok--> AwaitingHandoff --moved--> Done
//!          |                              |
//!          +------------ error -----------+-------------> Failed
//! ```
//!
//! `Failed` never changes which server the player is on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use portal_net::{
    Completion, RelayRequest, Request, RequestError, RequestHandler, Response, ResponseBody,
    ServerRegistry, TeleportRequest,
};

use crate::players::PlayerDirectory;

/// Progress of one teleport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeleportPhase {
    AwaitingDestinationReady,
    AwaitingHandoff,
    Done,
    Failed(RequestError),
}

/// Routes requests arriving at the proxy.
pub struct RelayRouter {
    registry: Arc<ServerRegistry>,
    players: Arc<dyn PlayerDirectory>,
}

impl RelayRouter {
    pub fn new(registry: Arc<ServerRegistry>, players: Arc<dyn PlayerDirectory>) -> Self {
        Self { registry, players }
    }

    /// Forwards `relay` as-is to its destination. A destination that is
    /// itself a router forwards it again.
    pub async fn relay(&self, relay: RelayRequest) -> Response {
        let Some(connection) = self.registry.get(&relay.destination) else {
            tracing::debug!("Relay to unknown server '{}'", relay.destination);
            return Err(RequestError::ServerNotFound(relay.destination));
        };
        connection.request(Request::Relay(relay)).await
    }

    /// Runs the teleport state machine to a terminal phase.
    pub async fn teleport(&self, request: TeleportRequest) -> Response {
        let player = request.player_id;
        let mut phase = TeleportPhase::AwaitingDestinationReady;

        loop {
            tracing::trace!("Teleport of {player} to '{}': {phase:?}", request.dest_server);
            phase = match phase {
                TeleportPhase::AwaitingDestinationReady => self.prepare_destination(&request).await,
                TeleportPhase::AwaitingHandoff => self.hand_off(&request),
                TeleportPhase::Done => {
                    tracing::info!("Player {player} handed off to '{}'", request.dest_server);
                    return Ok(ResponseBody::Empty);
                }
                TeleportPhase::Failed(error) => {
                    tracing::warn!(
                        "Teleport of {player} to '{}' failed: {error}",
                        request.dest_server
                    );
                    return Err(error);
                }
            };
        }
    }

    async fn prepare_destination(&self, request: &TeleportRequest) -> TeleportPhase {
        let Some(destination) = self.registry.get(&request.dest_server) else {
            return TeleportPhase::Failed(RequestError::ServerNotFound(request.dest_server.clone()));
        };
        match destination.request(Request::Teleport(request.clone())).await {
            Ok(_) => TeleportPhase::AwaitingHandoff,
            Err(error) => TeleportPhase::Failed(error),
        }
    }

    fn hand_off(&self, request: &TeleportRequest) -> TeleportPhase {
        let player = request.player_id;
        if self.players.player_exists(player)
            && self.players.change_player_server(player, &request.dest_server)
        {
            TeleportPhase::Done
        } else {
            TeleportPhase::Failed(RequestError::PlayerNotFound(player))
        }
    }

    /// Callback entry point: `on_finish` receives exactly one response from a
    /// spawned task.
    pub fn handle_request(self: &Arc<Self>, request: Request, on_finish: Completion) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let response = AssertUnwindSafe(router.handle(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    tracing::error!("Router panicked while handling a request");
                    Err(RequestError::internal())
                });
            on_finish(response);
        });
    }
}

#[async_trait]
impl RequestHandler for RelayRouter {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Relay(relay) => self.relay(relay).await,
            Request::Teleport(teleport) => self.teleport(teleport).await,
            Request::GetBlockChanges(_) => {
                tracing::error!("GetBlockChanges reached the proxy unrelayed");
                Err(RequestError::internal())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::players::ProxyPlayers;
    use portal_blocks::{IntVector, WorldRef};
    use portal_net::{
        Connection, ConnectionConfig, HandlerFn, PlayerId, RequestDispatcher, RequestKind,
        SpawnParams,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::duplex;

    /// Registers a backend called `name` whose dispatcher answers teleports
    /// and block requests with `answer`. Returns the counter of requests it
    /// saw.
    fn backend(
        registry: &ServerRegistry,
        name: &str,
        answer: Response,
    ) -> Arc<AtomicUsize> {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let handler: Arc<dyn RequestHandler> = Arc::new(HandlerFn(move |_req: Request| {
            let seen = Arc::clone(&seen_clone);
            let answer = answer.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                answer
            }
        }));
        let mut dispatcher = RequestDispatcher::for_server(name);
        dispatcher.register_shared(RequestKind::Teleport, Arc::clone(&handler));
        dispatcher.register_shared(RequestKind::GetBlockChanges, handler);

        let (proxy_side, server_side) = duplex(64 * 1024);
        Connection::spawn(server_side, "proxy", Arc::new(dispatcher), ConnectionConfig::default());
        let conn = Connection::spawn(
            proxy_side,
            name,
            Arc::new(RequestDispatcher::new()),
            ConnectionConfig::default(),
        );
        registry.register(conn).unwrap();
        seen
    }

    fn teleport(player: u128, dest: &str) -> TeleportRequest {
        TeleportRequest {
            player_id: PlayerId(player),
            dest_server: dest.into(),
            spawn: SpawnParams {
                world: WorldRef::new("overworld", 1),
                position: IntVector::new(0, 70, 0),
                yaw: 0.0,
                pitch: 0.0,
            },
        }
    }

    fn block_changes() -> Request {
        Request::GetBlockChanges(portal_net::GetBlockChangesRequest {
            world: WorldRef::new("overworld", 1),
            position: IntVector::ZERO,
            xz_radius: 1,
            y_radius: 1,
            rotate_to_origin: portal_blocks::Rotation::IDENTITY,
            change_set_id: portal_net::ChangeSetId(1),
            previous_change_set_id: None,
        })
    }

    fn router() -> (Arc<RelayRouter>, Arc<ServerRegistry>, Arc<ProxyPlayers>) {
        let registry = Arc::new(ServerRegistry::new());
        let players = Arc::new(ProxyPlayers::new());
        let router = Arc::new(RelayRouter::new(
            Arc::clone(&registry),
            Arc::clone(&players) as Arc<dyn PlayerDirectory>,
        ));
        (router, registry, players)
    }

    #[tokio::test]
    async fn test_relay_to_unknown_server() {
        let (router, _registry, _players) = router();
        let response = router
            .relay(RelayRequest {
                destination: "nether".into(),
                inner: Box::new(Request::Teleport(teleport(1, "nether"))),
            })
            .await;
        assert_eq!(response, Err(RequestError::ServerNotFound("nether".into())));
    }

    #[tokio::test]
    async fn test_relay_passes_response_through() {
        let (router, registry, _players) = router();
        let denied = Err(RequestError::remote("world is full"));
        let seen = backend(&registry, "survival", denied.clone());

        let response = router
            .handle(Request::relay("survival", block_changes()))
            .await;
        assert_eq!(response, denied);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_relayed_teleport_does_not_reach_arrivals() {
        let (router, registry, players) = router();
        let seen = backend(&registry, "survival", Ok(ResponseBody::Empty));
        players.connect(PlayerId(1), "alice", "lobby");

        let response = router
            .handle(Request::relay("survival", Request::Teleport(teleport(1, "survival"))))
            .await;
        assert!(matches!(response, Err(RequestError::Remote { .. })));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(players.current_server(PlayerId(1)).as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn test_teleport_moves_player_after_destination_ready() {
        let (router, registry, players) = router();
        backend(&registry, "survival", Ok(ResponseBody::Empty));
        players.connect(PlayerId(1), "alice", "lobby");

        let response = router.teleport(teleport(1, "survival")).await;
        assert_eq!(response, Ok(ResponseBody::Empty));
        assert_eq!(players.current_server(PlayerId(1)).as_deref(), Some("survival"));
    }

    #[tokio::test]
    async fn test_failed_preparation_leaves_player_in_place() {
        let (router, registry, players) = router();
        let refused = Err(RequestError::remote("spawn world missing"));
        backend(&registry, "survival", refused.clone());
        players.connect(PlayerId(1), "alice", "lobby");

        assert_eq!(router.teleport(teleport(1, "survival")).await, refused);
        assert_eq!(players.current_server(PlayerId(1)).as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn test_teleport_to_unknown_server() {
        let (router, _registry, players) = router();
        players.connect(PlayerId(1), "alice", "lobby");

        let response = router.teleport(teleport(1, "creative")).await;
        assert_eq!(response, Err(RequestError::ServerNotFound("creative".into())));
        assert_eq!(players.current_server(PlayerId(1)).as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn test_teleport_of_departed_player() {
        let (router, registry, players) = router();
        let seen = backend(&registry, "survival", Ok(ResponseBody::Empty));

        let response = router.teleport(teleport(5, "survival")).await;
        assert_eq!(response, Err(RequestError::PlayerNotFound(PlayerId(5))));
        assert_eq!(seen.load(Ordering::SeqCst), 1, "destination was asked first");
        assert!(players.is_empty());
    }

    #[tokio::test]
    async fn test_block_request_at_proxy_is_internal_error() {
        let (router, _registry, _players) = router();
        let (tx, rx) = tokio::sync::oneshot::channel();
        router.handle_request(
            block_changes(),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        assert_eq!(rx.await.unwrap(), Err(RequestError::internal()));
    }
}
