//! Which backend server each connected player is currently on.

use std::time::Instant;

use dashmap::DashMap;
use portal_net::PlayerId;

/// The proxy's view of player sessions, as consumed by teleport handoff.
pub trait PlayerDirectory: Send + Sync {
    fn player_exists(&self, player: PlayerId) -> bool;

    /// Points `player` at `server`. Returns `false` if the player has no
    /// session, in which case nothing changes.
    fn change_player_server(&self, player: PlayerId, server: &str) -> bool;

    fn current_server(&self, player: PlayerId) -> Option<String>;
}

/// One player's session on the proxy.
#[derive(Debug, Clone)]
pub struct PlayerSession {
    pub name: String,
    /// Server currently authoritative for the player.
    pub server: String,
    pub connected_at: Instant,
    /// Last time the active server changed.
    pub last_handoff: Option<Instant>,
}

/// In-memory [`PlayerDirectory`] backed by a concurrent map.
#[derive(Default)]
pub struct ProxyPlayers {
    sessions: DashMap<PlayerId, PlayerSession>,
}

impl ProxyPlayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session for `player` on `server`, replacing any older one.
    pub fn connect(&self, player: PlayerId, name: impl Into<String>, server: impl Into<String>) {
        let session = PlayerSession {
            name: name.into(),
            server: server.into(),
            connected_at: Instant::now(),
            last_handoff: None,
        };
        tracing::debug!("Player {} ({player}) joined on '{}'", session.name, session.server);
        self.sessions.insert(player, session);
    }

    /// Ends the session. Returns the server the player was on.
    pub fn disconnect(&self, player: PlayerId) -> Option<String> {
        self.sessions.remove(&player).map(|(_, session)| {
            tracing::debug!("Player {} ({player}) left from '{}'", session.name, session.server);
            session.server
        })
    }

    pub fn session(&self, player: PlayerId) -> Option<PlayerSession> {
        self.sessions.get(&player).map(|s| s.value().clone())
    }

    /// Players currently on `server`.
    pub fn players_on(&self, server: &str) -> Vec<PlayerId> {
        self.sessions
            .iter()
            .filter(|entry| entry.server == server)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl PlayerDirectory for ProxyPlayers {
    fn player_exists(&self, player: PlayerId) -> bool {
        self.sessions.contains_key(&player)
    }

    fn change_player_server(&self, player: PlayerId, server: &str) -> bool {
        match self.sessions.get_mut(&player) {
            Some(mut session) => {
                session.server = server.to_string();
                session.last_handoff = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    fn current_server(&self, player: PlayerId) -> Option<String> {
        self.sessions.get(&player).map(|s| s.server.clone())
    }
}
