use std::net::AddrParseError;

use portal_config::ConfigError;
use portal_net::ClientError;

/// Errors that stop a node from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid address '{address}': {source}")]
    Address {
        address: String,
        #[source]
        source: AddrParseError,
    },

    #[error("max_frame_bytes {configured} cannot carry a full changeset of {required} bytes")]
    FrameTooSmall { configured: u32, required: usize },

    #[error("portal '{portal}' has unknown direction '{direction}'")]
    Direction { portal: String, direction: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
