//! Viewer side of block mirroring.
//!
//! A [`RemoteBlockFetcher`] polls one destination region for changed blocks
//! and keeps a read-through cache of the last known state of each position,
//! keyed by local coordinate. At most one poll is outstanding per fetcher; a
//! failed poll leaves the cache as it was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use portal_blocks::{BlockState, IntVector, MaterialRegistry, Rotation, WorldRef};
use portal_net::{
    ChangeSetId, GetBlockChangesRequest, Request, Response, ResponseBody, Transport,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The fixed part of every poll a fetcher sends.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTarget {
    /// Server owning the blocks.
    pub server: String,
    pub world: WorldRef,
    /// Centre of the mirrored region on the destination.
    pub position: IntVector,
    pub xz_radius: u32,
    pub y_radius: u32,
    /// Destination orientation to origin orientation.
    pub rotate_to_origin: Rotation,
    /// Local coordinate the returned offsets are relative to.
    pub local_origin: IntVector,
}

/// State written by poll completions and read by everyone else.
struct FetchState {
    in_flight: AtomicBool,
    ready: AtomicBool,
    cache: DashMap<IntVector, BlockState>,
    /// Id of the last change set merged into the cache.
    last_applied: Mutex<Option<ChangeSetId>>,
}

impl FetchState {
    fn last_applied(&self) -> Option<ChangeSetId> {
        *self.last_applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(
        &self,
        target: &FetchTarget,
        materials: &MaterialRegistry,
        id: ChangeSetId,
        response: Response,
    ) {
        match response.and_then(ResponseBody::into_block_changes) {
            Ok(changes) => {
                let count = changes.len();
                for (offset, combined) in changes {
                    self.cache
                        .insert(target.local_origin + offset, materials.decode(combined));
                }
                *self.last_applied.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
                self.ready.store(true, Ordering::Release);
                tracing::trace!(
                    "Applied {count} change(s) from '{}' ({:?})",
                    target.server,
                    id
                );
            }
            Err(e) => {
                tracing::debug!("Block poll to '{}' failed: {e}", target.server);
            }
        }
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Mirrors the blocks around a remote portal.
pub struct RemoteBlockFetcher {
    transport: Arc<dyn Transport>,
    materials: Arc<MaterialRegistry>,
    target: Arc<FetchTarget>,
    state: Arc<FetchState>,
}

impl RemoteBlockFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        materials: Arc<MaterialRegistry>,
        target: FetchTarget,
    ) -> Self {
        Self {
            transport,
            materials,
            target: Arc::new(target),
            state: Arc::new(FetchState {
                in_flight: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                cache: DashMap::new(),
                last_applied: Mutex::new(None),
            }),
        }
    }

    pub fn target(&self) -> &FetchTarget {
        &self.target
    }

    /// Starts a poll unless one is already outstanding. Returns whether a
    /// request was sent.
    pub fn update(&self) -> bool {
        if self
            .state
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let id = ChangeSetId::random();
        let request = Request::GetBlockChanges(GetBlockChangesRequest {
            world: self.target.world.clone(),
            position: self.target.position,
            xz_radius: self.target.xz_radius,
            y_radius: self.target.y_radius,
            rotate_to_origin: self.target.rotate_to_origin,
            change_set_id: id,
            previous_change_set_id: self.state.last_applied(),
        });

        let state = Arc::clone(&self.state);
        let target = Arc::clone(&self.target);
        let materials = Arc::clone(&self.materials);
        self.transport.send(
            request,
            &self.target.server,
            Box::new(move |response| state.finish(&target, &materials, id, response)),
        );
        true
    }

    /// True once any poll has succeeded. Never reverts.
    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    pub fn is_polling(&self) -> bool {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Last known state at local coordinate `position`.
    pub fn get_data(&self, position: IntVector) -> Option<BlockState> {
        self.state.cache.get(&position).map(|state| *state)
    }

    /// Number of cached positions.
    pub fn cached_len(&self) -> usize {
        self.state.cache.len()
    }

    /// Calls [`update`](Self::update) every `interval` until `shutdown`
    /// turns true.
    pub fn spawn_polling(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        fetcher.update();
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

#[cfg(test)]
mod tests {
    use super::*;
    use portal_blocks::Material;
    use portal_net::{Completion, RequestError};

    /// Records sends and lets the test answer them by hand.
    #[derive(Default)]
    struct ManualTransport {
        sent: Mutex<Vec<(Request, String, Completion)>>,
    }

    impl ManualTransport {
        fn sent_len(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn answer_next(&self, response: Response) -> Request {
            let (request, _, on_complete) = self.sent.lock().unwrap().remove(0);
            on_complete(response);
            request
        }
    }

    impl Transport for ManualTransport {
        fn send(&self, request: Request, destination: &str, on_complete: Completion) {
            self.sent
                .lock()
                .unwrap()
                .push((request, destination.to_string(), on_complete));
        }
    }

    fn target() -> FetchTarget {
        FetchTarget {
            server: "survival".into(),
            world: WorldRef::new("overworld", 7),
            position: IntVector::new(10, 64, 10),
            xz_radius: 2,
            y_radius: 2,
            rotate_to_origin: Rotation::IDENTITY,
            local_origin: IntVector::ZERO,
        }
    }

    fn fetcher() -> (RemoteBlockFetcher, Arc<ManualTransport>) {
        let transport = Arc::new(ManualTransport::default());
        let fetcher = RemoteBlockFetcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(MaterialRegistry::with_defaults()),
            target(),
        );
        (fetcher, transport)
    }

    fn changes(entries: &[(IntVector, Material)]) -> Response {
        Ok(ResponseBody::BlockChanges(
            entries
                .iter()
                .map(|&(pos, material)| (pos, (material.0 as u32) << 8))
                .collect(),
        ))
    }

    #[test]
    fn test_update_while_in_flight_sends_nothing() {
        let (fetcher, transport) = fetcher();
        assert!(fetcher.update());
        assert!(!fetcher.update());
        assert!(!fetcher.update());
        assert_eq!(transport.sent_len(), 1);

        transport.answer_next(Err(RequestError::Timeout));
        assert!(!fetcher.is_polling());
        assert!(fetcher.update());
        assert_eq!(transport.sent_len(), 1);
    }

    #[test]
    fn test_ready_is_monotone() {
        let (fetcher, transport) = fetcher();
        assert!(!fetcher.is_ready());

        fetcher.update();
        transport.answer_next(Err(RequestError::ConnectionLost));
        assert!(!fetcher.is_ready(), "failure does not make a fetcher ready");

        fetcher.update();
        transport.answer_next(changes(&[]));
        assert!(fetcher.is_ready());

        for error in [RequestError::Timeout, RequestError::internal()] {
            fetcher.update();
            transport.answer_next(Err(error));
            assert!(fetcher.is_ready());
        }
    }

    #[test]
    fn test_glass_merged_and_neighbours_preserved() {
        let (fetcher, transport) = fetcher();
        let pos = IntVector::new(10, 64, 10);
        let neighbour = IntVector::new(11, 64, 10);

        fetcher.update();
        transport.answer_next(changes(&[(neighbour, Material::STONE)]));

        fetcher.update();
        transport.answer_next(changes(&[(pos, Material::GLASS)]));

        let glass = fetcher.get_data(pos).unwrap();
        assert_eq!(glass.material, Material::GLASS);
        assert_eq!(glass.data, 0);
        assert!(!glass.occludes);
        assert_eq!(fetcher.get_data(neighbour).unwrap().material, Material::STONE);
    }

    #[test]
    fn test_failed_poll_leaves_cache_untouched() {
        let (fetcher, transport) = fetcher();
        let pos = IntVector::new(1, 2, 3);
        fetcher.update();
        transport.answer_next(changes(&[(pos, Material::DIRT)]));

        fetcher.update();
        transport.answer_next(Ok(ResponseBody::Empty));
        assert_eq!(fetcher.get_data(pos).unwrap().material, Material::DIRT);
        assert_eq!(fetcher.cached_len(), 1);
    }

    #[test]
    fn test_previous_id_is_last_applied_answer() {
        let (fetcher, transport) = fetcher();

        fetcher.update();
        let Request::GetBlockChanges(first) = transport.answer_next(changes(&[])) else {
            panic!("expected block poll");
        };
        assert_eq!(first.previous_change_set_id, None);

        fetcher.update();
        let Request::GetBlockChanges(second) = transport.answer_next(Err(RequestError::Timeout))
        else {
            panic!("expected block poll");
        };
        assert_eq!(second.previous_change_set_id, Some(first.change_set_id));

        fetcher.update();
        let Request::GetBlockChanges(third) = transport.answer_next(changes(&[])) else {
            panic!("expected block poll");
        };
        assert_eq!(
            third.previous_change_set_id,
            Some(first.change_set_id),
            "an unanswered poll does not move the reference point"
        );
        assert_ne!(third.change_set_id, second.change_set_id);
    }

    #[test]
    fn test_offsets_translated_to_local_coordinates() {
        let transport = Arc::new(ManualTransport::default());
        let fetcher = RemoteBlockFetcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(MaterialRegistry::with_defaults()),
            FetchTarget {
                local_origin: IntVector::new(100, 70, -20),
                ..target()
            },
        );

        fetcher.update();
        transport.answer_next(changes(&[(IntVector::new(0, 1, 0), Material::WATER)]));
        assert_eq!(
            fetcher.get_data(IntVector::new(100, 71, -20)).unwrap().material,
            Material::WATER
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_driver_respects_backpressure() {
        let transport = Arc::new(ManualTransport::default());
        let fetcher = Arc::new(RemoteBlockFetcher::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(MaterialRegistry::with_defaults()),
            target(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = fetcher.spawn_polling(Duration::from_millis(100), stop_rx);

        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(transport.sent_len(), 1, "no answer yet, so no second poll");

        transport.answer_next(changes(&[]));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.sent_len(), 1, "polling resumes once answered");

        stop_tx.send(true).unwrap();
        driver.await.unwrap();
    }
}
