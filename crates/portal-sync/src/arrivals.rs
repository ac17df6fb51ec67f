//! Destination side of a teleport: the spawn point a player is expected at.
//!
//! When the proxy asks this server to get ready for a player, the spawn
//! parameters are checked against the local worlds and recorded. The join
//! layer collects them with [`ArrivalBook::take_arrival`] when the player
//! actually connects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use portal_blocks::WorldAccess;
use portal_net::{
    PlayerId, Request, RequestError, RequestHandler, Response, ResponseBody, SpawnParams,
    TeleportRequest,
};

/// A recorded but not yet consumed arrival.
#[derive(Debug, Clone)]
pub struct PendingArrival {
    pub spawn: SpawnParams,
    pub recorded_at: Instant,
}

/// Spawn points for players who are about to join this server.
pub struct ArrivalBook {
    worlds: Arc<dyn WorldAccess>,
    /// Arrivals older than this are dropped unconsumed.
    ttl: Duration,
    pending: DashMap<PlayerId, PendingArrival>,
}

impl ArrivalBook {
    pub fn new(worlds: Arc<dyn WorldAccess>, ttl: Duration) -> Self {
        Self {
            worlds,
            ttl,
            pending: DashMap::new(),
        }
    }

    /// Records where `request.player_id` should spawn. Fails if the spawn
    /// world does not exist here.
    pub fn prepare(&self, request: TeleportRequest) -> Result<(), RequestError> {
        self.worlds
            .world(&request.spawn.world)
            .map_err(|e| RequestError::remote(e.to_string()))?;

        tracing::debug!(
            "Expecting player {} in '{}' at {}",
            request.player_id,
            request.spawn.world.name,
            request.spawn.position
        );
        self.pending.insert(
            request.player_id,
            PendingArrival {
                spawn: request.spawn,
                recorded_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Consumes the arrival recorded for `player`, if it is still fresh.
    pub fn take_arrival(&self, player: PlayerId) -> Option<SpawnParams> {
        let (_, arrival) = self.pending.remove(&player)?;
        (arrival.recorded_at.elapsed() <= self.ttl).then_some(arrival.spawn)
    }

    /// Drops arrivals recorded before `now - ttl`. Returns how many.
    pub fn expire(&self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, arrival| now.saturating_duration_since(arrival.recorded_at) <= self.ttl);
        before.saturating_sub(self.pending.len())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[async_trait]
impl RequestHandler for ArrivalBook {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Teleport(teleport) => {
                self.prepare(teleport)?;
                Ok(ResponseBody::Empty)
            }
            other => {
                tracing::error!("Arrival handler received {:?}", other.kind());
                Err(RequestError::internal())
            }
        }
    }
}
