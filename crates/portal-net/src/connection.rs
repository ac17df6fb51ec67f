//! One logical link to one named remote server.
//!
//! A [`Connection`] owns three background tasks over a byte stream:
//!
//! - a writer draining an outbound envelope queue (plus keepalive frames),
//! - a reader matching inbound responses to pending requests and spawning a
//!   dispatch task per inbound request,
//! - a sweep failing requests whose deadline passed.
//!
//! When the link drops for any reason, every outstanding request completes
//! with [`RequestError::ConnectionLost`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::protocol::{Envelope, Request, RequestError, Response};
use crate::rpc::{Completion, PendingRequests, RequestDispatcher, complete_later};
use crate::wire::{FrameConfig, WireError, read_envelope, write_envelope, write_keepalive};

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Tunables for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline applied to every outbound request. Default: 10 s.
    pub request_timeout: Duration,
    /// How often overdue requests are swept. Default: 500 ms.
    pub sweep_interval: Duration,
    /// Interval between keepalive frames. Default: 5 s.
    pub keepalive_interval: Duration,
    pub frame: FrameConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(5),
            frame: FrameConfig::default(),
        }
    }
}

/// State shared between the handle and its background tasks.
struct Shared {
    pending: PendingRequests,
    closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    /// Idempotent teardown. `closed` is raised before the pending table is
    /// drained so a concurrent `send` either sees the flag or is drained.
    fn close(&self, peer: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ConnectionState::Disconnected);
        let failed = self.pending.fail_all(RequestError::ConnectionLost);
        tracing::info!("Connection to '{peer}' closed, {failed} outstanding request(s) failed");
    }
}

/// Handle to a live link with a remote server.
pub struct Connection {
    id: ConnectionId,
    peer_name: String,
    request_timeout: Duration,
    outbound: mpsc::UnboundedSender<Envelope>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Starts the background tasks over `stream`, an already-handshaken link
    /// to `peer_name`. Inbound requests are answered by `dispatcher`.
    pub fn spawn<S>(
        stream: S,
        peer_name: impl Into<String>,
        dispatcher: Arc<RequestDispatcher>,
        config: ConnectionConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer_name = peer_name.into();
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(Shared {
            pending: PendingRequests::new(),
            closed: AtomicBool::new(false),
            state,
        });

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            Arc::clone(&shared),
            peer_name.clone(),
            config.clone(),
        ));
        tokio::spawn(read_loop(
            reader,
            outbound.clone(),
            dispatcher,
            Arc::clone(&shared),
            peer_name.clone(),
            config.frame.clone(),
        ));
        tokio::spawn(sweep_loop(Arc::clone(&shared), config.sweep_interval));

        let id = ConnectionId::next();
        tracing::debug!("Connection {id:?} to '{peer_name}' established");

        Arc::new(Self {
            id,
            peer_name,
            request_timeout: config.request_timeout,
            outbound,
            shared,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Name of the server on the other end.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Number of requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Queues `request` and returns immediately. `on_complete` runs exactly
    /// once with the response, a timeout, or a connection-lost error.
    pub fn send(&self, request: Request, on_complete: Completion) {
        if self.is_closed() {
            complete_later(on_complete, Err(RequestError::ConnectionLost));
            return;
        }

        let pending = &self.shared.pending;
        let id = pending.next_id();
        pending.insert(
            id,
            request.kind(),
            Instant::now() + self.request_timeout,
            on_complete,
        );

        let queued = self.outbound.send(Envelope::Request { id, request }).is_ok();
        if !queued || self.is_closed() {
            pending.fail_later(id, RequestError::ConnectionLost);
        }
    }

    /// Async form of [`send`](Self::send).
    pub fn request(&self, request: Request) -> BoxFuture<'static, Response> {
        let (tx, rx) = oneshot::channel();
        self.send(
            request,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );
        async move { rx.await.unwrap_or(Err(RequestError::ConnectionLost)) }.boxed()
    }

    /// Drops the link. Outstanding requests fail with connection-lost.
    pub fn close(&self) {
        self.shared.close(&self.peer_name);
    }

    /// Resolves once the link is down.
    pub async fn closed(&self) {
        disconnected(&mut self.shared.state.subscribe()).await;
    }
}

async fn disconnected(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
    peer: String,
    config: ConnectionConfig,
) where
    W: AsyncWrite + Unpin,
{
    let mut state = shared.state.subscribe();
    let mut keepalive = tokio::time::interval(config.keepalive_interval);
    keepalive.tick().await;

    loop {
        let result = tokio::select! {
            envelope = outbound.recv() => match envelope {
                Some(envelope) => write_envelope(&mut writer, &envelope, &config.frame).await,
                None => break,
            },
            _ = keepalive.tick() => write_keepalive(&mut writer).await,
            _ = disconnected(&mut state) => break,
        };

        match result {
            Ok(()) => {}
            // An envelope that cannot be framed is dropped; its request
            // completes via the timeout sweep.
            Err(WireError::PayloadTooLarge { size, max }) => {
                tracing::warn!("Dropping {size}-byte envelope to '{peer}' (max {max})");
            }
            Err(e) => {
                tracing::warn!("Write to '{peer}' failed: {e}");
                break;
            }
        }
    }

    shared.close(&peer);
}

async fn read_loop<R>(
    mut reader: R,
    outbound: mpsc::UnboundedSender<Envelope>,
    dispatcher: Arc<RequestDispatcher>,
    shared: Arc<Shared>,
    peer: String,
    frame: FrameConfig,
) where
    R: AsyncRead + Unpin,
{
    let mut state = shared.state.subscribe();

    loop {
        let envelope = tokio::select! {
            result = read_envelope(&mut reader, &frame) => result,
            _ = disconnected(&mut state) => break,
        };

        match envelope {
            Ok(Envelope::Response { id, response }) => {
                if !shared.pending.complete(id, response) {
                    tracing::warn!("Discarding response from '{peer}' for unknown request {id:?}");
                }
            }
            Ok(Envelope::Request { id, request }) => {
                let dispatcher = Arc::clone(&dispatcher);
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response = dispatcher.dispatch(request).await;
                    // Nothing to do if the link closed meanwhile.
                    let _ = outbound.send(Envelope::Response { id, response });
                });
            }
            Ok(other) => {
                tracing::warn!("Ignoring unexpected {other:?} from '{peer}'");
            }
            Err(WireError::ConnectionClosed) => {
                tracing::debug!("'{peer}' closed the stream");
                break;
            }
            Err(e) => {
                tracing::warn!("Read from '{peer}' failed: {e}");
                break;
            }
        }
    }

    shared.close(&peer);
}

async fn sweep_loop(shared: Arc<Shared>, interval: Duration) {
    let mut state = shared.state.subscribe();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = shared.pending.expire(Instant::now());
                if expired > 0 {
                    tracing::debug!("{expired} request(s) timed out");
                }
            }
            _ = disconnected(&mut state) => break,
        }
    }
}
