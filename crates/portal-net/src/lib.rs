//! Request/response RPC between portal servers: wire codec, correlation of
//! outbound requests to asynchronous responses, per-link connections, the
//! handshake, the proxy-side server registry, and the server-side client.

pub mod client;
pub mod connection;
pub mod handshake;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod rpc;
pub mod wire;

pub use client::{
    ClientConfig, ClientError, PROXY_PEER_NAME, PortalClient, ReconnectPolicy, ReconnectState,
};
pub use connection::{Connection, ConnectionConfig, ConnectionId, ConnectionState};
pub use handshake::{HandshakeError, accept_handshake, initiate_handshake};
pub use protocol::{
    BlockChanges, ChangeSetId, Envelope, GetBlockChangesRequest, MAX_BLOCK_CHANGE_ENTRY_BYTES,
    PROTOCOL_VERSION, PlayerId, RelayRequest, Request, RequestError, RequestId, RequestKind, Response, ResponseBody,
    SpawnParams, TeleportRequest, max_block_changes_payload,
};
pub use proxy::{ProxyConfig, ProxyListener};
pub use registry::{RegistryError, ServerRegistry};
pub use rpc::{
    Completion, HandlerFn, PendingRequests, RequestDispatcher, RequestHandler, Transport,
    TransportExt,
};
pub use wire::{FrameConfig, WireError, read_envelope, write_envelope};
