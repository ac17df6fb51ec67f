//! Portal state synchronisation on top of `portal-net`: the viewer-side
//! block fetcher, the owner-side change producer, the proxy's relay router
//! and teleport handoff, and assembly of the request dispatcher for each
//! node role.

pub mod arrivals;
pub mod changes;
pub mod fetcher;
pub mod node;
pub mod players;
pub mod router;

pub use arrivals::{ArrivalBook, PendingArrival};
pub use changes::BlockChangeService;
pub use fetcher::{FetchTarget, RemoteBlockFetcher};
pub use node::{proxy_dispatcher, server_dispatcher};
pub use players::{PlayerDirectory, PlayerSession, ProxyPlayers};
pub use router::{RelayRouter, TeleportPhase};
