//! Live world read capability.
//!
//! The host server supplies block reads through [`BlockReader`] and world
//! resolution through [`WorldAccess`]. [`InMemoryWorld`] is a concurrent
//! block store used by the standalone node and by tests.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::coords::IntVector;
use crate::material::Material;

/// Identifies a world on a remote server: its name plus a stable id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldRef {
    pub name: String,
    pub id: u128,
}

impl WorldRef {
    pub fn new(name: impl Into<String>, id: u128) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// The raw block read from the world, before occlusion is derived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RawBlock {
    pub material: Material,
    pub data: u8,
}

impl RawBlock {
    pub const AIR: Self = Self {
        material: Material::AIR,
        data: 0,
    };

    pub fn new(material: Material, data: u8) -> Self {
        Self { material, data }
    }
}

/// Reads the live block at a position. Positions that were never written read
/// as air.
pub trait BlockReader: Send + Sync {
    fn read_block(&self, position: IntVector) -> RawBlock;
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("unknown world '{name}' ({id:032x})")]
    UnknownWorld { name: String, id: u128 },
}

/// Resolves a [`WorldRef`] to a readable world.
pub trait WorldAccess: Send + Sync {
    fn world(&self, world: &WorldRef) -> Result<Arc<dyn BlockReader>, WorldError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Sparse concurrent block store. Unset positions are air.
#[derive(Default)]
pub struct InMemoryWorld {
    blocks: DashMap<IntVector, RawBlock>,
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block(&self, position: IntVector, block: RawBlock) {
        if block == RawBlock::AIR {
            self.blocks.remove(&position);
        } else {
            self.blocks.insert(position, block);
        }
    }

    /// Fills the inclusive box `min..=max` with `block`.
    pub fn fill(&self, min: IntVector, max: IntVector, block: RawBlock) {
        for x in min.x..=max.x {
            for y in min.y..=max.y {
                for z in min.z..=max.z {
                    self.set_block(IntVector::new(x, y, z), block);
                }
            }
        }
    }

    /// Number of non-air blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockReader for InMemoryWorld {
    fn read_block(&self, position: IntVector) -> RawBlock {
        self.blocks
            .get(&position)
            .map(|entry| *entry.value())
            .unwrap_or(RawBlock::AIR)
    }
}

/// A set of named in-memory worlds.
#[derive(Default)]
pub struct InMemoryWorlds {
    worlds: DashMap<String, (u128, Arc<InMemoryWorld>)>,
}

impl InMemoryWorlds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or returns the existing) world with this name.
    pub fn create(&self, world: &WorldRef) -> Arc<InMemoryWorld> {
        let entry = self
            .worlds
            .entry(world.name.clone())
            .or_insert_with(|| (world.id, Arc::new(InMemoryWorld::new())));
        Arc::clone(&entry.value().1)
    }
}

impl WorldAccess for InMemoryWorlds {
    /// A world whose id matches must also match by name. An unknown id falls
    /// back to the name, so a world recreated under the same name is still
    /// found.
    fn world(&self, world: &WorldRef) -> Result<Arc<dyn BlockReader>, WorldError> {
        let id_holder = self
            .worlds
            .iter()
            .find(|entry| entry.value().0 == world.id)
            .map(|entry| entry.key().clone());

        let resolved = match id_holder {
            Some(name) if name != world.name => {
                tracing::debug!(
                    "World id {:032x} belongs to '{name}', not '{}'",
                    world.id,
                    world.name
                );
                None
            }
            _ => self
                .worlds
                .get(&world.name)
                .map(|entry| Arc::clone(&entry.value().1)),
        };

        resolved
            .map(|w| w as Arc<dyn BlockReader>)
            .ok_or_else(|| WorldError::UnknownWorld {
                name: world.name.clone(),
                id: world.id,
            })
    }
}
