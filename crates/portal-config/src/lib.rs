//! Configuration for portal nodes.
//!
//! Settings persist to disk as a RON file, are overridable from the command
//! line via clap, and support hot-reload detection. Unknown fields are
//! ignored and missing ones take their defaults.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, FetchConfig, NodeConfig, NodeRole, PortalConfig, ProxyConfig, RpcConfig,
    TrackerConfig,
};
pub use error::ConfigError;
