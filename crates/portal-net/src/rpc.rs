//! Request correlation and dispatch.
//!
//! Outbound: a [`PendingRequests`] table maps each [`RequestId`] to the
//! completion waiting for it and a deadline. Whoever removes an entry (a
//! matching response, the timeout sweep, connection loss) invokes its
//! completion, so every completion runs exactly once.
//!
//! Inbound: a [`RequestDispatcher`] maps [`RequestKind`] values to
//! [`RequestHandler`] implementations and turns handler panics into an
//! internal error response.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::protocol::{Request, RequestError, RequestId, RequestKind, Response};

/// One-shot continuation receiving the response to a request.
///
/// `Sync` because pending completions live in tables shared between a
/// connection's tasks.
pub type Completion = Box<dyn FnOnce(Response) + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Sends a request to a named server and reports its response.
///
/// `send` returns immediately. `on_complete` runs exactly once, after `send`
/// has returned, on whichever task observed the outcome.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request, destination: &str, on_complete: Completion);
}

/// Async convenience over [`Transport::send`].
pub trait TransportExt: Transport {
    fn request(&self, request: Request, destination: &str) -> BoxFuture<'static, Response> {
        let (tx, rx) = oneshot::channel();
        self.send(
            request,
            destination,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
        );
        async move { rx.await.unwrap_or(Err(RequestError::ConnectionLost)) }.boxed()
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

/// Runs `on_complete` on another task so it never executes inside the
/// caller's `send`.
pub(crate) fn complete_later(on_complete: Completion, response: Response) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { invoke(on_complete, response) });
        }
        Err(_) => {
            std::thread::spawn(move || invoke(on_complete, response));
        }
    }
}

/// Invokes a completion, containing a panic so the calling task survives.
fn invoke(on_complete: Completion, response: Response) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| on_complete(response))) {
        tracing::error!("Request completion panicked: {}", panic_message(&*panic));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// PendingRequests
// ---------------------------------------------------------------------------

struct PendingEntry {
    kind: RequestKind,
    deadline: Instant,
    on_complete: Completion,
}

/// Outstanding requests of one connection.
pub struct PendingRequests {
    entries: DashMap<RequestId, PendingEntry>,
    next: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Next unused id, monotonically increasing.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, id: RequestId, kind: RequestKind, deadline: Instant, on_complete: Completion) {
        self.entries.insert(
            id,
            PendingEntry {
                kind,
                deadline,
                on_complete,
            },
        );
    }

    /// Completes `id` inline. Returns `false` if nothing was waiting for it.
    pub fn complete(&self, id: RequestId, response: Response) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                invoke(entry.on_complete, response);
                true
            }
            None => false,
        }
    }

    /// Fails `id` from a separate task. Used where the caller may still be
    /// inside `send`.
    pub fn fail_later(&self, id: RequestId, error: RequestError) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                complete_later(entry.on_complete, Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding request with `error`. Returns how many.
    pub fn fail_all(&self, error: RequestError) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|(_, entry)| invoke(entry.on_complete, Err(error.clone())))
            .count()
    }

    /// Fails every request whose deadline is at or before `now` with
    /// [`RequestError::Timeout`]. Returns how many.
    pub fn expire(&self, now: Instant) -> usize {
        let overdue: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|e| e.value().deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut expired = 0;
        for id in overdue {
            if let Some((_, entry)) = self.entries.remove_if(&id, |_, e| e.deadline <= now) {
                tracing::debug!("{:?} request {id:?} timed out", entry.kind);
                invoke(entry.on_complete, Err(RequestError::Timeout));
                expired += 1;
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Produces the response to an inbound request. A handler may itself send
/// further requests before it returns.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Adapts an async closure into a [`RequestHandler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Response> + Send,
{
    async fn handle(&self, request: Request) -> Response {
        (self.0)(request).await
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes inbound requests to handlers by [`RequestKind`].
pub struct RequestDispatcher {
    /// Relays addressed to this name are unwrapped and dispatched locally.
    local_name: Option<String>,
    handlers: HashMap<RequestKind, Arc<dyn RequestHandler>>,
}

impl RequestDispatcher {
    /// A dispatcher that treats every relay as something to route onwards.
    pub fn new() -> Self {
        Self {
            local_name: None,
            handlers: HashMap::new(),
        }
    }

    /// A dispatcher for the server named `local_name`: relays addressed to it
    /// are terminated here.
    pub fn for_server(local_name: impl Into<String>) -> Self {
        Self {
            local_name: Some(local_name.into()),
            handlers: HashMap::new(),
        }
    }

    pub fn register<H: RequestHandler + 'static>(&mut self, kind: RequestKind, handler: H) {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn register_shared(&mut self, kind: RequestKind, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn registered_kinds(&self) -> impl Iterator<Item = &RequestKind> {
        self.handlers.keys()
    }

    /// Produces exactly one response for `request`.
    pub fn dispatch(&self, request: Request) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            let request = match request {
                Request::Relay(relay) if self.local_name.as_deref() == Some(&*relay.destination) => {
                    if relay.inner.kind() == RequestKind::Teleport {
                        tracing::warn!(
                            "Relayed teleport reached '{}'; only the proxy hands players off",
                            relay.destination
                        );
                        return Err(RequestError::remote(
                            "teleports must be sent to the proxy, not relayed",
                        ));
                    }
                    return self.dispatch(*relay.inner).await;
                }
                other => other,
            };

            let kind = request.kind();
            let Some(handler) = self.handlers.get(&kind) else {
                tracing::error!("No handler registered for {kind:?}; this node cannot serve it");
                return Err(RequestError::internal());
            };

            tracing::trace!("Dispatching {kind:?} request");
            match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
                Ok(response) => response,
                Err(panic) => {
                    tracing::error!(
                        "{kind:?} handler panicked: {}",
                        panic_message(&*panic)
                    );
                    Err(RequestError::internal())
                }
            }
        })
    }

    /// Callback form of [`dispatch`](Self::dispatch): `on_finish` receives the
    /// response from a spawned task.
    pub fn handle_request(self: &Arc<Self>, request: Request, on_finish: Completion) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let response = dispatcher.dispatch(request).await;
            invoke(on_finish, response);
        });
    }
}

impl Default for RequestDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
