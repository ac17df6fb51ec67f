//! Translation from the on-disk config into runtime settings.

use std::net::SocketAddr;
use std::time::Duration;

use portal_blocks::{IntVector, PortalDirection, Rotation, TrackedRegion, WorldRef};
use portal_config::{Config, FetchConfig, PortalConfig};
use portal_net::{
    ClientConfig, ConnectionConfig, FrameConfig, ProxyConfig, ReconnectPolicy,
    max_block_changes_payload,
};
use portal_sync::FetchTarget;

use crate::error::NodeError;

pub fn parse_addr(address: &str) -> Result<SocketAddr, NodeError> {
    address.parse().map_err(|source| NodeError::Address {
        address: address.to_string(),
        source,
    })
}

/// Link settings. Every node may carry a full changeset for the largest
/// trackable region, whether answering one or relaying it, so the frame
/// limit must fit one.
pub fn connection_config(config: &Config) -> Result<ConnectionConfig, NodeError> {
    let required = max_block_changes_payload(TrackedRegion::max());
    let configured = config.proxy.max_frame_bytes;
    if (configured as usize) < required {
        return Err(NodeError::FrameTooSmall {
            configured,
            required,
        });
    }

    Ok(ConnectionConfig {
        request_timeout: Duration::from_millis(config.rpc.request_timeout_ms),
        sweep_interval: Duration::from_millis(config.rpc.sweep_interval_ms),
        keepalive_interval: Duration::from_millis(config.rpc.keepalive_interval_ms),
        frame: FrameConfig {
            max_payload_size: configured,
        },
    })
}

pub fn proxy_config(config: &Config) -> Result<ProxyConfig, NodeError> {
    Ok(ProxyConfig {
        bind_addr: parse_addr(&config.proxy.bind_address)?,
        handshake_timeout: Duration::from_millis(config.proxy.handshake_timeout_ms),
        connection: connection_config(config)?,
    })
}

pub fn client_config(config: &Config) -> Result<ClientConfig, NodeError> {
    Ok(ClientConfig {
        connection: connection_config(config)?,
        handshake_timeout: Duration::from_millis(config.proxy.handshake_timeout_ms),
    })
}

pub fn reconnect_policy(config: &Config) -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(config.rpc.reconnect_initial_ms),
        backoff_multiplier: config.rpc.reconnect_multiplier,
        max_delay: Duration::from_millis(config.rpc.reconnect_max_ms),
        max_attempts: config.rpc.reconnect_max_attempts,
        jitter: config.rpc.reconnect_jitter,
    }
}

fn direction(portal: &PortalConfig, name: &str) -> Result<PortalDirection, NodeError> {
    PortalDirection::from_storage(name).ok_or_else(|| NodeError::Direction {
        portal: portal.name.clone(),
        direction: name.to_string(),
    })
}

/// What a fetcher for `portal` polls. Offsets come back in the local
/// portal's orientation and are anchored at its position.
pub fn fetch_target(portal: &PortalConfig, fetch: &FetchConfig) -> Result<FetchTarget, NodeError> {
    let local = direction(portal, &portal.local_direction)?;
    let destination = direction(portal, &portal.destination_direction)?;
    Ok(FetchTarget {
        server: portal.destination_server.clone(),
        world: WorldRef::new(
            portal.destination_world.clone(),
            u128::from(portal.destination_world_id),
        ),
        position: IntVector::from(portal.destination_position),
        xz_radius: fetch.xz_radius,
        y_radius: fetch.y_radius,
        rotate_to_origin: Rotation::between(destination, local),
        local_origin: IntVector::from(portal.local_position),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations_follow_config() {
        let mut config = Config::default();
        config.rpc.request_timeout_ms = 2_500;
        config.proxy.max_frame_bytes = 2 * 1_048_576;
        let conn = connection_config(&config).unwrap();
        assert_eq!(conn.request_timeout, Duration::from_millis(2_500));
        assert_eq!(conn.sweep_interval, Duration::from_millis(500));
        assert_eq!(conn.frame.max_payload_size, 2 * 1_048_576);

        let policy = reconnect_policy(&config);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, None);
    }

    #[test]
    fn test_frame_limit_must_fit_full_changeset() {
        let mut config = Config::default();
        assert!(connection_config(&config).is_ok());

        config.proxy.max_frame_bytes = 4096;
        assert!(matches!(
            client_config(&config),
            Err(NodeError::FrameTooSmall { configured: 4096, required })
                if required == max_block_changes_payload(TrackedRegion::max())
        ));
        assert!(matches!(
            proxy_config(&config),
            Err(NodeError::FrameTooSmall { .. })
        ));
    }

    #[test]
    fn test_bad_bind_address() {
        let mut config = Config::default();
        config.proxy.bind_address = "not-an-address".into();
        assert!(matches!(
            proxy_config(&config),
            Err(NodeError::Address { address, .. }) if address == "not-an-address"
        ));
    }

    #[test]
    fn test_fetch_target_from_portal() {
        let portal = PortalConfig {
            local_position: [100, 70, -20],
            destination_world_id: 7,
            destination_position: [5, 64, 5],
            ..PortalConfig::default()
        };
        let target = fetch_target(&portal, &FetchConfig::default()).unwrap();
        assert_eq!(target.server, "survival");
        assert_eq!(target.world, WorldRef::new("overworld", 7));
        assert_eq!(target.position, IntVector::new(5, 64, 5));
        assert_eq!(target.local_origin, IntVector::new(100, 70, -20));
        assert_eq!(target.rotate_to_origin, Rotation::IDENTITY);
        assert_eq!(target.xz_radius, 8);
    }

    #[test]
    fn test_facing_portals_rotate_half_turn() {
        let portal = PortalConfig {
            local_direction: "NORTH".into(),
            destination_direction: "SOUTH".into(),
            ..PortalConfig::default()
        };
        let target = fetch_target(&portal, &FetchConfig::default()).unwrap();
        assert_eq!(
            target.rotate_to_origin.apply(IntVector::new(1, 0, 0)),
            IntVector::new(-1, 0, 0)
        );
    }

    #[test]
    fn test_unknown_direction_rejected() {
        let portal = PortalConfig {
            destination_direction: "SIDEWAYS".into(),
            ..PortalConfig::default()
        };
        assert!(matches!(
            fetch_target(&portal, &FetchConfig::default()),
            Err(NodeError::Direction { direction, .. }) if direction == "SIDEWAYS"
        ));
    }
}
