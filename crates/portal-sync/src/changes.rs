//! Owner side of block mirroring: answers `GetBlockChanges` by sweeping a
//! [`ChangeTracker`] over the live world.
//!
//! Trackers are keyed by the change set id of the request that last swept
//! them. A request naming a known `previous_change_set_id` reuses that
//! tracker, so only the positions that changed since the requester's last
//! applied answer are reported. Otherwise a fresh tracker is built and the
//! full region is reported, which lets a requester that lost an answer
//! resynchronise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use portal_blocks::{
    ChangeTracker, MAX_XZ_RADIUS, MAX_Y_RADIUS, MaterialRegistry, TrackedRegion, WorldAccess,
    WorldRef,
};
use portal_net::{
    BlockChanges, ChangeSetId, GetBlockChangesRequest, Request, RequestError, RequestHandler,
    Response, ResponseBody,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

struct TrackedEntry {
    world: WorldRef,
    tracker: ChangeTracker,
    last_used: Instant,
}

/// Produces block changesets for remote fetchers.
pub struct BlockChangeService {
    worlds: Arc<dyn WorldAccess>,
    materials: Arc<MaterialRegistry>,
    trackers: DashMap<ChangeSetId, Arc<Mutex<TrackedEntry>>>,
    idle_timeout: Duration,
}

impl BlockChangeService {
    pub fn new(
        worlds: Arc<dyn WorldAccess>,
        materials: Arc<MaterialRegistry>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            worlds,
            materials,
            trackers: DashMap::new(),
            idle_timeout,
        }
    }

    /// Number of live trackers.
    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    /// Sweeps the requested region and returns the changed positions, keyed
    /// by their offset from the centre rotated into the requester's frame.
    pub async fn get_block_changes(
        &self,
        request: &GetBlockChangesRequest,
    ) -> Result<BlockChanges, RequestError> {
        let region = TrackedRegion::bounded(request.xz_radius, request.y_radius).ok_or_else(|| {
            tracing::debug!(
                "Refusing {}x{} region around {}",
                request.xz_radius,
                request.y_radius,
                request.position
            );
            RequestError::remote(format!(
                "radius {}x{} exceeds {MAX_XZ_RADIUS}x{MAX_Y_RADIUS}",
                request.xz_radius, request.y_radius
            ))
        })?;
        let reader = self
            .worlds
            .world(&request.world)
            .map_err(|e| RequestError::remote(e.to_string()))?;

        let entry = self.checkout(request, region);
        let mut entry = entry.lock().await;
        entry.last_used = Instant::now();

        let full = !entry.tracker.is_initialised();
        let changed = entry.tracker.sweep(reader.as_ref(), request.position);
        let indices: Box<dyn Iterator<Item = usize>> = if full {
            Box::new(0..region.volume())
        } else {
            Box::new(changed.into_iter())
        };

        let changes: BlockChanges = indices
            .map(|index| {
                let offset = request.rotate_to_origin.apply(region.offset_of(index));
                (offset, entry.tracker.state_at(index).combined_id())
            })
            .collect();

        tracing::trace!(
            "Change set {:?} for '{}' at {}: {} position(s){}",
            request.change_set_id,
            request.world.name,
            request.position,
            changes.len(),
            if full { " (full)" } else { "" }
        );
        Ok(changes)
    }

    /// Moves the tracker filed under the previous id to the new id, or files
    /// a fresh one.
    fn checkout(
        &self,
        request: &GetBlockChangesRequest,
        region: TrackedRegion,
    ) -> Arc<Mutex<TrackedEntry>> {
        let reusable = request
            .previous_change_set_id
            .and_then(|previous| self.trackers.remove(&previous))
            .map(|(_, entry)| entry)
            .filter(|entry| {
                // Still locked by the sweep answering `previous`: start over.
                entry.try_lock().is_ok_and(|e| {
                    e.world == request.world && e.tracker.region() == region
                })
            });

        let entry = reusable.unwrap_or_else(|| {
            Arc::new(Mutex::new(TrackedEntry {
                world: request.world.clone(),
                tracker: ChangeTracker::new(region, Arc::clone(&self.materials)),
                last_used: Instant::now(),
            }))
        });
        self.trackers
            .insert(request.change_set_id, Arc::clone(&entry));
        entry
    }

    /// Drops trackers unused since `now - idle_timeout`. Returns how many.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.trackers.len();
        self.trackers.retain(|_, entry| match entry.try_lock() {
            Ok(e) => now.saturating_duration_since(e.last_used) < self.idle_timeout,
            Err(_) => true,
        });
        let evicted = before.saturating_sub(self.trackers.len());
        if evicted > 0 {
            tracing::debug!("Evicted {evicted} idle tracker(s)");
        }
        evicted
    }

    /// Runs [`evict_idle`](Self::evict_idle) every `interval` until
    /// `shutdown` turns true.
    pub fn spawn_eviction(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.evict_idle(Instant::now());
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
}

#[async_trait]
impl RequestHandler for BlockChangeService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::GetBlockChanges(request) => self
                .get_block_changes(&request)
                .await
                .map(ResponseBody::BlockChanges),
            other => {
                tracing::error!("Block change handler received {:?}", other.kind());
                Err(RequestError::internal())
            }
        }
    }
}
