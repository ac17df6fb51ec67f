//! Proxy accept loop: every backend server connects here, announces its
//! name, and stays registered until its link drops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::connection::{Connection, ConnectionConfig};
use crate::handshake::{HandshakeError, accept_handshake};
use crate::registry::ServerRegistry;
use crate::rpc::RequestDispatcher;

/// Configuration for [`ProxyListener`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind to. Default: `0.0.0.0:25590`.
    pub bind_addr: SocketAddr,
    /// How long a new link may take to send its hello. Default: 5 s.
    pub handshake_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 25590)),
            handshake_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Accepts server links and keeps the [`ServerRegistry`] in sync with them.
pub struct ProxyListener {
    config: ProxyConfig,
    registry: Arc<ServerRegistry>,
    dispatcher: Arc<RequestDispatcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyListener {
    /// `dispatcher` answers requests arriving from any server.
    pub fn new(
        config: ProxyConfig,
        registry: Arc<ServerRegistry>,
        dispatcher: Arc<RequestDispatcher>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            registry,
            dispatcher,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Proxy listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener.
    pub async fn run_with_listener(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    stream.set_nodelay(true)?;
                    tracing::debug!("Accepted link from {peer_addr}");

                    let proxy = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = proxy.serve_link(stream).await {
                            tracing::warn!("Link from {peer_addr} refused: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        for name in self.registry.names() {
            if let Some(conn) = self.registry.get(&name) {
                conn.close();
            }
        }
        Ok(())
    }

    /// Handshakes `stream`, registers it, and holds the registration until
    /// the link closes or the proxy shuts down.
    pub async fn serve_link<S>(&self, mut stream: S) -> Result<(), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let name = accept_handshake(
            &mut stream,
            &self.config.connection.frame,
            self.config.handshake_timeout,
            |name| registry.can_register(name).map_err(|e| e.to_string()),
        )
        .await?;

        let connection = Connection::spawn(
            stream,
            name.clone(),
            Arc::clone(&self.dispatcher),
            self.config.connection.clone(),
        );
        if let Err(e) = self.registry.register(Arc::clone(&connection)) {
            // Lost a race with another link claiming the same name.
            connection.close();
            return Err(HandshakeError::Rejected(e.to_string()));
        }
        tracing::info!("Server '{name}' connected");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let stopping = async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        };
        tokio::select! {
            _ = connection.closed() => {}
            _ = stopping => connection.close(),
        }

        self.registry.unregister(&name, connection.id());
        tracing::info!("Server '{name}' disconnected");
        Ok(())
    }

    /// Signal the accept loop and every link to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
