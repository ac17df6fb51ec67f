//! Command-line argument parsing for portal nodes.

use std::path::PathBuf;

use clap::Parser;

use crate::config::NodeRole;
use crate::Config;

/// Portal node command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "portal-node", about = "Portal block mirroring node")]
pub struct CliArgs {
    /// Run as the proxy or as a backend server.
    #[arg(long, value_enum)]
    pub role: Option<NodeRole>,

    /// Server name announced to the proxy.
    #[arg(long)]
    pub name: Option<String>,

    /// Proxy address servers connect to.
    #[arg(long)]
    pub proxy: Option<String>,

    /// Address the proxy listens on.
    #[arg(long)]
    pub bind: Option<String>,

    /// Per-request deadline in milliseconds.
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(role) = args.role {
            self.node.role = role;
        }
        if let Some(ref name) = args.name {
            self.node.name = name.clone();
        }
        if let Some(ref addr) = args.proxy {
            self.proxy.address = addr.clone();
        }
        if let Some(ref addr) = args.bind {
            self.proxy.bind_address = addr.clone();
        }
        if let Some(ms) = args.request_timeout_ms {
            self.rpc.request_timeout_ms = ms;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
