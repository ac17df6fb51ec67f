//! Per-region block diff engine.
//!
//! A [`ChangeTracker`] remembers the material, data value and occlusion of
//! every position in a [`TrackedRegion`] around a centre point, in three
//! parallel arrays sharing one flattened index. Each [`sweep`](ChangeTracker::sweep)
//! re-reads the live world and reports the indices whose state changed since
//! the previous sweep.

use std::sync::Arc;

use crate::coords::IntVector;
use crate::material::{BlockState, Material, MaterialRegistry};
use crate::world::BlockReader;

// ---------------------------------------------------------------------------
// TrackedRegion
// ---------------------------------------------------------------------------

/// Largest horizontal radius a tracker accepts.
pub const MAX_XZ_RADIUS: u32 = 24;
/// Largest vertical radius a tracker accepts.
pub const MAX_Y_RADIUS: u32 = 24;

/// A box of `(2 * xz_radius + 1)` by `(2 * y_radius + 1)` by
/// `(2 * xz_radius + 1)` blocks centred on the origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackedRegion {
    pub xz_radius: u32,
    pub y_radius: u32,
}

impl TrackedRegion {
    pub fn new(xz_radius: u32, y_radius: u32) -> Self {
        Self {
            xz_radius,
            y_radius,
        }
    }

    /// Like [`new`](Self::new), but `None` when either radius exceeds
    /// [`MAX_XZ_RADIUS`] or [`MAX_Y_RADIUS`].
    pub fn bounded(xz_radius: u32, y_radius: u32) -> Option<Self> {
        (xz_radius <= MAX_XZ_RADIUS && y_radius <= MAX_Y_RADIUS)
            .then(|| Self::new(xz_radius, y_radius))
    }

    /// The largest region [`bounded`](Self::bounded) accepts.
    pub const fn max() -> Self {
        Self {
            xz_radius: MAX_XZ_RADIUS,
            y_radius: MAX_Y_RADIUS,
        }
    }

    fn xz_span(&self) -> usize {
        2 * self.xz_radius as usize + 1
    }

    fn y_span(&self) -> usize {
        2 * self.y_radius as usize + 1
    }

    /// Total number of positions in the region.
    pub fn volume(&self) -> usize {
        self.xz_span() * self.y_span() * self.xz_span()
    }

    /// Flattened index of an offset from the centre, or `None` if outside.
    pub fn index_of(&self, offset: IntVector) -> Option<usize> {
        let xz = self.xz_radius as i64;
        let y = self.y_radius as i64;
        let (dx, dy, dz) = (offset.x as i64 + xz, offset.y as i64 + y, offset.z as i64 + xz);
        let (xz_span, y_span) = (self.xz_span() as i64, self.y_span() as i64);

        if !(0..xz_span).contains(&dx) || !(0..y_span).contains(&dy) || !(0..xz_span).contains(&dz) {
            return None;
        }
        Some(((dx * y_span + dy) * xz_span + dz) as usize)
    }

    /// Inverse of [`index_of`](Self::index_of).
    pub fn offset_of(&self, index: usize) -> IntVector {
        let (xz_span, y_span) = (self.xz_span(), self.y_span());
        let dz = index % xz_span;
        let dy = (index / xz_span) % y_span;
        let dx = index / (xz_span * y_span);
        IntVector::new(
            dx as i32 - self.xz_radius as i32,
            dy as i32 - self.y_radius as i32,
            dz as i32 - self.xz_radius as i32,
        )
    }

    /// Every offset in index order.
    pub fn offsets(&self) -> impl Iterator<Item = IntVector> + '_ {
        (0..self.volume()).map(|index| self.offset_of(index))
    }
}

// ---------------------------------------------------------------------------
// ChangeTracker
// ---------------------------------------------------------------------------

/// Last-sampled block state for every position of a region.
///
/// The three arrays are empty until [`initialise`](Self::initialise), then all
/// hold exactly `region.volume()` entries for the tracker's lifetime.
pub struct ChangeTracker {
    region: TrackedRegion,
    registry: Arc<MaterialRegistry>,
    occlusion: Vec<bool>,
    materials: Vec<Material>,
    data_values: Vec<u8>,
}

impl ChangeTracker {
    pub fn new(region: TrackedRegion, registry: Arc<MaterialRegistry>) -> Self {
        Self {
            region,
            registry,
            occlusion: Vec::new(),
            materials: Vec::new(),
            data_values: Vec::new(),
        }
    }

    pub fn region(&self) -> TrackedRegion {
        self.region
    }

    pub fn is_initialised(&self) -> bool {
        !self.materials.is_empty()
    }

    /// Allocates the arrays, all positions starting as air with data 0.
    ///
    /// Returns `false` if they were already allocated.
    pub fn initialise(&mut self) -> bool {
        if self.is_initialised() {
            return false;
        }

        let volume = self.region.volume();
        self.occlusion = vec![false; volume];
        self.materials = vec![Material::AIR; volume];
        self.data_values = vec![0; volume];
        true
    }

    /// Re-reads the block at `position` and compares it with entry `index`.
    ///
    /// Returns `true` and stores the new state if material or data differ;
    /// returns `false` without writing anything otherwise.
    ///
    /// # Panics
    ///
    /// Panics if the tracker is not initialised or `index` is outside the
    /// region; both are programming errors.
    pub fn sample(&mut self, reader: &dyn BlockReader, position: IntVector, index: usize) -> bool {
        debug_assert!(self.is_initialised(), "sample called before initialise");

        let block = reader.read_block(position);
        if self.materials[index] == block.material && self.data_values[index] == block.data {
            return false;
        }

        self.materials[index] = block.material;
        self.data_values[index] = block.data;
        self.occlusion[index] = self.registry.is_occluding(block.material);
        true
    }

    /// Samples every position of the region around `center` and returns the
    /// indices that changed, in index order.
    pub fn sweep(&mut self, reader: &dyn BlockReader, center: IntVector) -> Vec<usize> {
        if self.initialise() {
            tracing::trace!("Allocated tracker of {} positions", self.region.volume());
        }

        let region = self.region;
        (0..region.volume())
            .filter(|&index| self.sample(reader, center + region.offset_of(index), index))
            .collect()
    }

    /// Stored state at `index`.
    pub fn state_at(&self, index: usize) -> BlockState {
        BlockState {
            material: self.materials[index],
            data: self.data_values[index],
            occludes: self.occlusion[index],
        }
    }

    pub fn occlusion(&self) -> &[bool] {
        &self.occlusion
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn data_values(&self) -> &[u8] {
        &self.data_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{InMemoryWorld, RawBlock};

    fn tracker(xz: u32, y: u32) -> ChangeTracker {
        ChangeTracker::new(
            TrackedRegion::new(xz, y),
            Arc::new(MaterialRegistry::with_defaults()),
        )
    }

    #[test]
    fn test_region_volume() {
        assert_eq!(TrackedRegion::new(0, 0).volume(), 1);
        assert_eq!(TrackedRegion::new(2, 1).volume(), 5 * 3 * 5);
    }

    #[test]
    fn test_bounded_region_rejects_oversized_radius() {
        assert_eq!(
            TrackedRegion::bounded(MAX_XZ_RADIUS, MAX_Y_RADIUS),
            Some(TrackedRegion::max())
        );
        assert_eq!(TrackedRegion::bounded(MAX_XZ_RADIUS + 1, 0), None);
        assert_eq!(TrackedRegion::bounded(0, MAX_Y_RADIUS + 1), None);
        assert_eq!(TrackedRegion::bounded(u32::MAX, u32::MAX), None);
    }

    #[test]
    fn test_index_and_offset_are_inverse() {
        let region = TrackedRegion::new(3, 2);
        for index in 0..region.volume() {
            assert_eq!(region.index_of(region.offset_of(index)), Some(index));
        }
    }

    #[test]
    fn test_index_outside_region() {
        let region = TrackedRegion::new(1, 1);
        assert_eq!(region.index_of(IntVector::new(2, 0, 0)), None);
        assert_eq!(region.index_of(IntVector::new(0, -2, 0)), None);
        assert_eq!(region.index_of(IntVector::new(-1, -1, -1)), Some(0));
    }

    #[test]
    fn test_initialise_is_idempotent() {
        let mut t = tracker(1, 1);
        assert!(!t.is_initialised());
        assert!(t.initialise());
        assert!(!t.initialise());
        assert_eq!(t.materials().len(), 27);
        assert_eq!(t.data_values().len(), 27);
        assert_eq!(t.occlusion().len(), 27);
    }

    #[test]
    fn test_stone_to_air_then_unchanged() {
        let world = InMemoryWorld::new();
        let mut t = tracker(1, 1);
        t.initialise();
        let pos = IntVector::new(5, 70, 5);

        world.set_block(pos, RawBlock::new(Material::STONE, 0));
        assert!(t.sample(&world, pos, 5));
        assert_eq!(t.materials()[5], Material::STONE);
        assert!(t.occlusion()[5]);

        world.set_block(pos, RawBlock::AIR);
        assert!(t.sample(&world, pos, 5));
        assert_eq!(t.materials()[5], Material::AIR);
        assert!(!t.occlusion()[5]);

        assert!(!t.sample(&world, pos, 5));
    }

    #[test]
    fn test_second_sample_always_unchanged() {
        let world = InMemoryWorld::new();
        let mut t = tracker(0, 0);
        t.initialise();

        // Air matches the zeroed initial state.
        assert!(!t.sample(&world, IntVector::ZERO, 0));
        assert!(!t.sample(&world, IntVector::ZERO, 0));

        world.set_block(IntVector::ZERO, RawBlock::new(Material::DIRT, 2));
        assert!(t.sample(&world, IntVector::ZERO, 0));
        assert!(!t.sample(&world, IntVector::ZERO, 0));
    }

    #[test]
    fn test_data_value_change_is_detected() {
        let world = InMemoryWorld::new();
        let mut t = tracker(0, 0);
        t.initialise();
        world.set_block(IntVector::ZERO, RawBlock::new(Material::GRASS, 1));
        t.sample(&world, IntVector::ZERO, 0);

        world.set_block(IntVector::ZERO, RawBlock::new(Material::GRASS, 2));
        assert!(t.sample(&world, IntVector::ZERO, 0));
        assert_eq!(t.state_at(0).data, 2);
    }

    #[test]
    fn test_sweep_reports_only_changes() {
        let world = InMemoryWorld::new();
        let center = IntVector::new(10, 64, 10);
        world.set_block(center, RawBlock::new(Material::GLASS, 0));
        world.set_block(center + IntVector::new(1, 0, 0), RawBlock::new(Material::STONE, 0));

        let mut t = tracker(1, 1);
        let first = t.sweep(&world, center);
        assert_eq!(first.len(), 2);
        let region = t.region();
        assert!(first.contains(&region.index_of(IntVector::ZERO).unwrap()));

        assert!(t.sweep(&world, center).is_empty(), "no mutation, no changes");

        world.set_block(center, RawBlock::AIR);
        let third = t.sweep(&world, center);
        assert_eq!(third, vec![region.index_of(IntVector::ZERO).unwrap()]);
    }

    #[test]
    fn test_sweep_ignores_blocks_outside_region() {
        let world = InMemoryWorld::new();
        world.set_block(IntVector::new(5, 0, 0), RawBlock::new(Material::STONE, 0));
        let mut t = tracker(1, 1);
        assert!(t.sweep(&world, IntVector::ZERO).is_empty());
    }
}
