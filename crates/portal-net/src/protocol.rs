//! Request, response and envelope types exchanged between portal servers.
//!
//! Every wire message is an [`Envelope`]. Requests are a tagged enum with one
//! variant per [`RequestKind`]; exactly one [`Response`] answers each request.

use std::collections::HashMap;

use portal_blocks::{IntVector, Rotation, TrackedRegion, WorldRef};
use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every serialized envelope.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Correlation id assigned by a connection to each outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Requester-minted token naming one block fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeSetId(pub u128);

impl ChangeSetId {
    /// A fresh random id. Collisions are negligible at 128 bits.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

/// Player identity shared by every server behind the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u128);

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Block position to combined block id (see `BlockState::combined_id`).
///
/// A position missing from the map is unchanged since the requester's
/// reference point.
pub type BlockChanges = HashMap<IntVector, u32>;

/// Encoded size bound of one [`BlockChanges`] entry for any region within
/// [`TrackedRegion::max`]: three single-byte offsets and a combined id of at
/// most four varint bytes.
pub const MAX_BLOCK_CHANGE_ENTRY_BYTES: usize = 7;

/// Version byte, envelope and result tags, request id and map length.
const BLOCK_CHANGES_ENVELOPE_BYTES: usize = 32;

/// Largest payload a response carrying a full changeset for `region` can
/// take on the wire. `region` must be within [`TrackedRegion::max`].
pub fn max_block_changes_payload(region: TrackedRegion) -> usize {
    region.volume() * MAX_BLOCK_CHANGE_ENTRY_BYTES + BLOCK_CHANGES_ENVELOPE_BYTES
}

/// Asks the owning server for the blocks that changed around a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBlockChangesRequest {
    /// World on the destination server.
    pub world: WorldRef,
    /// Centre of the tracked region in destination coordinates.
    pub position: IntVector,
    pub xz_radius: u32,
    pub y_radius: u32,
    /// Rotation from the destination portal's orientation to the origin's,
    /// applied to offsets before they are returned.
    pub rotate_to_origin: Rotation,
    /// Id of this fetch cycle.
    pub change_set_id: ChangeSetId,
    /// Id of the last cycle the requester applied, which the owning server
    /// may use as the reference point for an incremental diff.
    pub previous_change_set_id: Option<ChangeSetId>,
}

/// Forwards `inner` to `destination` through the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub destination: String,
    pub inner: Box<Request>,
}

/// Where a player appears on the destination server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnParams {
    pub world: WorldRef,
    pub position: IntVector,
    pub yaw: f32,
    pub pitch: f32,
}

/// Moves a player to another server once that server is ready for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleportRequest {
    pub player_id: PlayerId,
    pub dest_server: String,
    pub spawn: SpawnParams,
}

/// A request. The variant is the type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Relay(RelayRequest),
    Teleport(TeleportRequest),
    GetBlockChanges(GetBlockChangesRequest),
}

/// Dispatch key for [`Request`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Relay,
    Teleport,
    GetBlockChanges,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Relay(_) => RequestKind::Relay,
            Request::Teleport(_) => RequestKind::Teleport,
            Request::GetBlockChanges(_) => RequestKind::GetBlockChanges,
        }
    }

    /// Wraps `inner` in a relay addressed to `destination`.
    pub fn relay(destination: impl Into<String>, inner: Request) -> Self {
        Request::Relay(RelayRequest {
            destination: destination.into(),
            inner: Box::new(inner),
        })
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Success payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Empty,
    BlockChanges(BlockChanges),
}

impl ResponseBody {
    /// Extracts a block changeset, treating any other body as a remote error.
    pub fn into_block_changes(self) -> Result<BlockChanges, RequestError> {
        match self {
            ResponseBody::BlockChanges(changes) => Ok(changes),
            other => Err(RequestError::Remote {
                message: format!("expected block changes, got {other:?}"),
            }),
        }
    }
}

/// Failure of a request. Crosses the wire, so it carries no local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RequestError {
    /// Relay or teleport addressed to a server the proxy does not know.
    #[error("no server named '{0}' is connected")]
    ServerNotFound(String),

    /// Teleport for a player the proxy has no session for.
    #[error("no player with id {0} exists")]
    PlayerNotFound(PlayerId),

    /// The handler failed while processing the request.
    #[error("request failed: {message}")]
    Remote { message: String },

    /// The link dropped while the request was outstanding.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// No response arrived before the request's deadline.
    #[error("request timed out")]
    Timeout,
}

impl RequestError {
    /// Generic error returned for failures whose detail stays local.
    pub fn internal() -> Self {
        RequestError::Remote {
            message: "internal error occurred while processing request".to_string(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        RequestError::Remote {
            message: message.into(),
        }
    }
}

/// Exactly one of these answers each request.
pub type Response = Result<ResponseBody, RequestError>;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// First message a server sends after connecting to the proxy.
    Hello { server_name: String },
    /// The proxy's answer to [`Envelope::Hello`].
    HelloAck {
        accepted: bool,
        reason: Option<String>,
    },
    Request { id: RequestId, request: Request },
    Response { id: RequestId, response: Response },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_request() -> GetBlockChangesRequest {
        GetBlockChangesRequest {
            world: WorldRef::new("overworld", 1),
            position: IntVector::new(10, 64, 10),
            xz_radius: 4,
            y_radius: 2,
            rotate_to_origin: Rotation::IDENTITY,
            change_set_id: ChangeSetId(5),
            previous_change_set_id: None,
        }
    }

    #[test]
    fn test_kind_matches_variant() {
        let inner = Request::GetBlockChanges(block_request());
        assert_eq!(inner.kind(), RequestKind::GetBlockChanges);
        assert_eq!(Request::relay("lobby", inner).kind(), RequestKind::Relay);
    }

    #[test]
    fn test_relay_wraps_inner_unchanged() {
        let inner = Request::GetBlockChanges(block_request());
        match Request::relay("survival", inner.clone()) {
            Request::Relay(relay) => {
                assert_eq!(relay.destination, "survival");
                assert_eq!(*relay.inner, inner);
            }
            other => panic!("expected relay, got {other:?}"),
        }
    }

    /// Every offset of `region` mapped to the largest combined id.
    fn worst_case_changes(region: TrackedRegion) -> BlockChanges {
        region
            .offsets()
            .map(|offset| (offset, (u32::from(u16::MAX) << 8) | 0xFF))
            .collect()
    }

    #[test]
    fn test_full_changeset_stays_within_bound() {
        let region = TrackedRegion::max();
        let envelope = Envelope::Response {
            id: RequestId(u64::MAX),
            response: Ok(ResponseBody::BlockChanges(worst_case_changes(region))),
        };
        let encoded = crate::wire::encode_envelope(&envelope).unwrap();

        assert!(encoded.len() <= max_block_changes_payload(region));
        assert!(
            max_block_changes_payload(region)
                <= crate::wire::FrameConfig::default().max_payload_size as usize
        );
    }

    #[test]
    fn test_change_set_ids_are_fresh() {
        assert_ne!(ChangeSetId::random(), ChangeSetId::random());
    }

    #[test]
    fn test_into_block_changes_rejects_empty() {
        let result = ResponseBody::Empty.into_block_changes();
        assert!(matches!(result, Err(RequestError::Remote { .. })));
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let message = RequestError::internal().to_string();
        assert!(message.contains("internal error"));
    }
}
