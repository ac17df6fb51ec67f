//! Block-level world state for portal mirroring: integer coordinates, portal
//! orientation, material metadata, encoded block states, the live world read
//! capability, and the per-region change tracker.

pub mod coords;
pub mod material;
pub mod tracker;
pub mod world;

pub use coords::{IntVector, PortalDirection, Rotation};
pub use material::{BlockState, Material, MaterialDef, MaterialRegistry, RegistryError};
pub use tracker::{ChangeTracker, MAX_XZ_RADIUS, MAX_Y_RADIUS, TrackedRegion};
pub use world::{
    BlockReader, InMemoryWorld, InMemoryWorlds, RawBlock, WorldAccess, WorldError, WorldRef,
};
