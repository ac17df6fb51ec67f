//! Dispatch tables for the two node roles.

use std::sync::Arc;

use portal_net::{RequestDispatcher, RequestKind};

use crate::arrivals::ArrivalBook;
use crate::changes::BlockChangeService;
use crate::router::RelayRouter;

/// Dispatcher for a backend server named `name`: it owns blocks and accepts
/// arriving players. Relays addressed to `name` are unwrapped locally.
pub fn server_dispatcher(
    name: &str,
    changes: Arc<BlockChangeService>,
    arrivals: Arc<ArrivalBook>,
) -> RequestDispatcher {
    let mut dispatcher = RequestDispatcher::for_server(name);
    dispatcher.register_shared(RequestKind::GetBlockChanges, changes);
    dispatcher.register_shared(RequestKind::Teleport, arrivals);
    dispatcher
}

/// Dispatcher for the proxy: routes relays and orchestrates teleports.
pub fn proxy_dispatcher(router: Arc<RelayRouter>) -> RequestDispatcher {
    let mut dispatcher = RequestDispatcher::new();
    dispatcher.register_shared(RequestKind::Relay, Arc::clone(&router) as _);
    dispatcher.register_shared(RequestKind::Teleport, router);
    dispatcher
}
