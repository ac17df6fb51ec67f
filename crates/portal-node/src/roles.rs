//! Wiring for the two node roles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use portal_blocks::{InMemoryWorlds, MaterialRegistry, WorldRef};
use portal_config::Config;
use portal_net::{PortalClient, ProxyListener, ServerRegistry, Transport};
use portal_sync::{
    ArrivalBook, BlockChangeService, PlayerDirectory, ProxyPlayers, RelayRouter,
    RemoteBlockFetcher, proxy_dispatcher, server_dispatcher,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::NodeError;
use crate::settings::{
    client_config, fetch_target, parse_addr, proxy_config, reconnect_policy,
};

/// Accepts server links and routes between them until `shutdown` fires.
pub async fn run_proxy(config: &Config, shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
    let registry = Arc::new(ServerRegistry::new());
    let players = Arc::new(ProxyPlayers::new());
    let router = Arc::new(RelayRouter::new(
        Arc::clone(&registry),
        Arc::clone(&players) as Arc<dyn PlayerDirectory>,
    ));
    let listener = Arc::new(ProxyListener::new(
        proxy_config(config)?,
        registry,
        Arc::new(proxy_dispatcher(router)),
    ));

    let mut accept = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.run().await })
    };

    let finished = tokio::select! {
        _ = wait_for_shutdown(shutdown) => None,
        result = &mut accept => Some(result),
    };
    tracing::info!(
        "Proxy stopping with {} linked server(s) and {} player(s)",
        listener.registry().len(),
        players.len()
    );
    let result = match finished {
        Some(result) => result,
        None => {
            listener.shutdown();
            accept.await
        }
    };
    result??;
    Ok(())
}

/// Hosts worlds, links to the proxy and mirrors the configured portals
/// until `shutdown` fires.
pub async fn run_server(config: &Config, shutdown: watch::Receiver<bool>) -> Result<(), NodeError> {
    let addr = parse_addr(&config.proxy.address)?;
    let link = client_config(config)?;
    let targets = config
        .portals
        .iter()
        .map(|portal| Ok((portal, fetch_target(portal, &config.fetch)?)))
        .collect::<Result<Vec<_>, NodeError>>()?;

    let materials = Arc::new(MaterialRegistry::with_defaults());
    let worlds = Arc::new(InMemoryWorlds::new());
    for (id, name) in config.node.worlds.iter().enumerate() {
        worlds.create(&WorldRef::new(name.clone(), id as u128));
    }
    tracing::info!(
        "Hosting {} world(s) as '{}'",
        config.node.worlds.len(),
        config.node.name
    );

    let changes = Arc::new(BlockChangeService::new(
        Arc::clone(&worlds) as _,
        Arc::clone(&materials),
        Duration::from_secs(config.tracker.idle_timeout_secs),
    ));
    let arrivals = Arc::new(ArrivalBook::new(
        worlds,
        Duration::from_secs(config.tracker.arrival_ttl_secs),
    ));
    let eviction_interval = Duration::from_secs(config.tracker.eviction_interval_secs.max(1));

    // Background tasks stop on this rather than on `shutdown` so a link that
    // gives up also stops them.
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = vec![
        changes.spawn_eviction(eviction_interval, stop_rx.clone()),
        spawn_arrival_expiry(Arc::clone(&arrivals), eviction_interval, stop_rx.clone()),
    ];

    let client = Arc::new(PortalClient::new(
        config.node.name.clone(),
        Arc::new(server_dispatcher(&config.node.name, changes, arrivals)),
        link,
    ));

    let poll_interval = Duration::from_millis(config.fetch.poll_interval_ms.max(1));
    let mut fetchers = Vec::with_capacity(targets.len());
    for (portal, target) in targets {
        let fetcher = Arc::new(RemoteBlockFetcher::new(
            Arc::clone(&client) as Arc<dyn Transport>,
            Arc::clone(&materials),
            target,
        ));
        tasks.push(fetcher.spawn_polling(poll_interval, stop_rx.clone()));
        tracing::info!(
            "Mirroring portal '{}' from '{}'",
            portal.name,
            portal.destination_server
        );
        fetchers.push((portal.name.clone(), fetcher));
    }

    let policy = reconnect_policy(config);
    let watcher = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            wait_for_shutdown(shutdown).await;
            client.shutdown();
        })
    };
    let linked = client.run(addr, policy).await;
    watcher.abort();

    let _ = stop_tx.send(true);
    for task in tasks {
        task.await?;
    }
    for (name, fetcher) in &fetchers {
        tracing::debug!(
            "Portal '{name}' stopped with {} cached block(s), ready: {}",
            fetcher.cached_len(),
            fetcher.is_ready()
        );
    }
    linked?;
    Ok(())
}

fn spawn_arrival_expiry(
    arrivals: Arc<ArrivalBook>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = arrivals.expire(Instant::now());
                    if expired > 0 {
                        tracing::debug!("Dropped {expired} unclaimed arrival(s)");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
