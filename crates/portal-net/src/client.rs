//! Backend-server side of the proxy link.
//!
//! A [`PortalClient`] holds at most one live [`Connection`] to the proxy and
//! implements [`Transport`] over it: requests for another server are wrapped
//! in a relay and routed by the proxy. [`PortalClient::run`] keeps the link
//! up, reconnecting with exponential backoff when it drops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionConfig};
use crate::handshake::{HandshakeError, initiate_handshake};
use crate::protocol::{Request, RequestError};
use crate::rpc::{Completion, RequestDispatcher, Transport, complete_later};

/// Peer name given to the connection towards the proxy.
pub const PROXY_PEER_NAME: &str = "proxy";

// ---------------------------------------------------------------------------
// Reconnection backoff
// ---------------------------------------------------------------------------

/// Backoff applied between connection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Upper bound on the delay. Default: 30 s.
    pub max_delay: Duration,
    /// Attempts before giving up. `None` retries forever. Default: `None`.
    pub max_attempts: Option<u32>,
    /// Applied as ±jitter to each delay (0.0–1.0). Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            jitter: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before retry number `attempt` (0-based):
    /// `initial_delay * backoff_multiplier^attempt`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.max_delay
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Retries used during the current outage.
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the policy's attempts
    /// are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts
            && self.attempts >= max
        {
            return None;
        }
        let delay = self.policy.jittered(self.policy.base_delay(self.attempts));
        self.attempts += 1;
        Some(delay)
    }

    /// Starts a fresh outage after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("gave up after {0} connection attempts")]
    AttemptsExhausted(u32),
}

/// Settings for a [`PortalClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Default: 5 s.
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// A backend server's link to the proxy.
pub struct PortalClient {
    server_name: String,
    dispatcher: Arc<RequestDispatcher>,
    config: ClientConfig,
    connection: watch::Sender<Option<Arc<Connection>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PortalClient {
    /// `dispatcher` answers requests the proxy routes to this server.
    pub fn new(
        server_name: impl Into<String>,
        dispatcher: Arc<RequestDispatcher>,
        config: ClientConfig,
    ) -> Self {
        let (connection, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            server_name: server_name.into(),
            dispatcher,
            config,
            connection,
            shutdown_tx,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Handshakes over an already-open stream and makes it the live link.
    pub async fn attach<S>(&self, mut stream: S) -> Result<Arc<Connection>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        initiate_handshake(
            &mut stream,
            &self.server_name,
            &self.config.connection.frame,
            self.config.handshake_timeout,
        )
        .await?;

        let connection = Connection::spawn(
            stream,
            PROXY_PEER_NAME,
            Arc::clone(&self.dispatcher),
            self.config.connection.clone(),
        );
        if let Some(previous) = self.connection.send_replace(Some(Arc::clone(&connection))) {
            previous.close();
        }
        tracing::info!("'{}' linked to proxy", self.server_name);
        Ok(connection)
    }

    /// Opens a TCP link to the proxy at `addr`.
    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Connection>, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(self.attach(stream).await?)
    }

    /// Keeps a link to `addr` alive until [`shutdown`](Self::shutdown) or
    /// until `policy` runs out of attempts.
    pub async fn run(&self, addr: SocketAddr, policy: ReconnectPolicy) -> Result<(), ClientError> {
        let mut backoff = ReconnectState::new(policy);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.connect(addr).await {
                Ok(connection) => {
                    backoff.reset();
                    tokio::select! {
                        _ = connection.closed() => {
                            tracing::warn!("Lost link to proxy at {addr}");
                        }
                        _ = shutdown_rx.changed() => {
                            connection.close();
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Connecting to proxy at {addr} failed: {e}");
                }
            }

            let Some(delay) = backoff.next_delay() else {
                return Err(ClientError::AttemptsExhausted(backoff.attempts()));
            };
            tracing::info!("Reconnection attempt {} in {delay:?}", backoff.attempts());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        self.connection.send_replace(None);
        Ok(())
    }

    /// Stops [`run`](Self::run) and drops the live link.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(connection) = self.connection() {
            connection.close();
        }
    }

    /// The live link, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection
            .borrow()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /// Sends `request` for the proxy itself to handle, unwrapped.
    pub fn send_to_proxy(&self, request: Request, on_complete: Completion) {
        match self.connection() {
            Some(connection) => connection.send(request, on_complete),
            None => complete_later(on_complete, Err(RequestError::ConnectionLost)),
        }
    }
}

impl Transport for PortalClient {
    /// Teleports go to the proxy as-is, since the proxy performs the handoff.
    /// Everything else is relayed to `destination`.
    fn send(&self, request: Request, destination: &str, on_complete: Completion) {
        match request {
            Request::Teleport(teleport) if teleport.dest_server != destination => {
                complete_later(
                    on_complete,
                    Err(RequestError::remote(format!(
                        "teleport to '{}' sent towards '{destination}'",
                        teleport.dest_server
                    ))),
                );
            }
            teleport @ Request::Teleport(_) => self.send_to_proxy(teleport, on_complete),
            other => self.send_to_proxy(Request::relay(destination, other), on_complete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::accept_handshake;
    use crate::protocol::{
        ChangeSetId, GetBlockChangesRequest, PlayerId, ResponseBody, SpawnParams, TeleportRequest,
    };
    use crate::rpc::TransportExt;
    use crate::wire::{FrameConfig, read_envelope, write_envelope};
    use crate::protocol::Envelope;
    use portal_blocks::{IntVector, Rotation, WorldRef};
    use tokio::io::duplex;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    fn teleport() -> Request {
        Request::Teleport(TeleportRequest {
            player_id: PlayerId(7),
            dest_server: "survival".into(),
            spawn: SpawnParams {
                world: WorldRef::new("overworld", 1),
                position: IntVector::ZERO,
                yaw: 90.0,
                pitch: 0.0,
            },
        })
    }

    fn block_changes() -> Request {
        Request::GetBlockChanges(GetBlockChangesRequest {
            world: WorldRef::new("overworld", 1),
            position: IntVector::new(10, 64, 10),
            xz_radius: 2,
            y_radius: 2,
            rotate_to_origin: Rotation::IDENTITY,
            change_set_id: ChangeSetId(3),
            previous_change_set_id: None,
        })
    }

    /// Accepts the handshake on `proxy_side`, checks the first request
    /// against `expected` and answers it with an empty success.
    fn fake_proxy(
        mut proxy_side: tokio::io::DuplexStream,
        expected: Request,
    ) -> tokio::task::JoinHandle<tokio::io::DuplexStream> {
        tokio::spawn(async move {
            let frame = FrameConfig::default();
            let name = accept_handshake(&mut proxy_side, &frame, Duration::from_secs(1), |_| Ok(()))
                .await
                .unwrap();
            assert_eq!(name, "survival");

            let Envelope::Request { id, request } =
                read_envelope(&mut proxy_side, &frame).await.unwrap()
            else {
                panic!("expected a request");
            };
            assert_eq!(request, expected);
            write_envelope(
                &mut proxy_side,
                &Envelope::Response {
                    id,
                    response: Ok(ResponseBody::Empty),
                },
                &frame,
            )
            .await
            .unwrap();
            proxy_side
        })
    }

    #[test]
    fn test_backoff_sequence_doubles_then_caps() {
        let mut state = ReconnectState::new(no_jitter());
        let delays: Vec<u64> = (0..7)
            .map(|_| state.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_base_delay_saturates_at_max() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_unlimited_attempts_by_default() {
        let mut state = ReconnectState::new(no_jitter());
        for _ in 0..1000 {
            assert!(state.next_delay().is_some());
        }
    }

    #[test]
    fn test_bounded_attempts_exhaust() {
        let mut state = ReconnectState::new(ReconnectPolicy {
            max_attempts: Some(2),
            ..no_jitter()
        });
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_some());
        assert!(state.next_delay().is_none());

        state.reset();
        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..50 {
            let mut state = ReconnectState::new(ReconnectPolicy::default());
            let d = state.next_delay().unwrap();
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[tokio::test]
    async fn test_disconnected_client_fails_fast() {
        let client = PortalClient::new(
            "survival",
            Arc::new(RequestDispatcher::new()),
            ClientConfig::default(),
        );
        assert!(!client.is_connected());
        assert_eq!(
            client.request(block_changes(), "lobby").await,
            Err(RequestError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_requests_are_relayed_through_proxy() {
        let (client_side, proxy_side) = duplex(8192);
        let proxy = fake_proxy(proxy_side, Request::relay("lobby", block_changes()));

        let client = PortalClient::new(
            "survival",
            Arc::new(RequestDispatcher::new()),
            ClientConfig::default(),
        );
        client.attach(client_side).await.unwrap();
        assert!(client.is_connected());

        assert_eq!(client.request(block_changes(), "lobby").await, Ok(ResponseBody::Empty));
        let _proxy_side = proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_teleport_goes_to_proxy_unwrapped() {
        let (client_side, proxy_side) = duplex(8192);
        let proxy = fake_proxy(proxy_side, teleport());

        let client = PortalClient::new(
            "survival",
            Arc::new(RequestDispatcher::new()),
            ClientConfig::default(),
        );
        client.attach(client_side).await.unwrap();

        assert_eq!(client.request(teleport(), "survival").await, Ok(ResponseBody::Empty));
        let _proxy_side = proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_teleport_towards_other_server_is_refused() {
        let client = PortalClient::new(
            "survival",
            Arc::new(RequestDispatcher::new()),
            ClientConfig::default(),
        );
        let response = client.request(teleport(), "lobby").await;
        assert!(matches!(response, Err(RequestError::Remote { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_drops_link() {
        let (client_side, mut proxy_side) = duplex(8192);
        let accept = tokio::spawn(async move {
            accept_handshake(&mut proxy_side, &FrameConfig::default(), Duration::from_secs(1), |_| Ok(()))
                .await
                .unwrap();
            proxy_side
        });

        let client = PortalClient::new(
            "survival",
            Arc::new(RequestDispatcher::new()),
            ClientConfig::default(),
        );
        let conn = client.attach(client_side).await.unwrap();
        let _proxy_side = accept.await.unwrap();

        client.shutdown();
        conn.closed().await;
        assert!(!client.is_connected());
    }
}
