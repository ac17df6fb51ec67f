//! Material registry and the encoded block state carried over the wire.
//!
//! Air is always material 0 so a zero-initialised tracker describes empty
//! space. Materials are looked up in a [`MaterialRegistry`] to derive whether
//! a block fully occludes light.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Compact material identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Material(pub u16);

impl Material {
    pub const AIR: Self = Self(0);
    pub const STONE: Self = Self(1);
    pub const DIRT: Self = Self(2);
    pub const GRASS: Self = Self(3);
    pub const GLASS: Self = Self(4);
    pub const WATER: Self = Self(5);
    pub const OBSIDIAN: Self = Self(6);

    pub fn is_air(self) -> bool {
        self.0 == 0
    }
}

/// Descriptor for a registered material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDef {
    /// Human-readable name (e.g. "stone", "glass").
    pub name: String,
    /// Whether the block fully blocks light and visibility.
    pub occluding: bool,
}

/// Errors that can occur during material registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate material name: {0}")]
    DuplicateName(String),
    #[error("material registry is full (max 65536 materials)")]
    RegistryFull,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps [`Material`] to [`MaterialDef`] with O(1) lookup in both directions.
pub struct MaterialRegistry {
    /// Dense array where `index == Material.0`.
    materials: Vec<MaterialDef>,
    name_to_id: HashMap<String, Material>,
}

impl MaterialRegistry {
    /// Creates a registry holding only air.
    pub fn new() -> Self {
        let mut name_to_id = HashMap::new();
        name_to_id.insert("air".to_string(), Material::AIR);
        Self {
            materials: vec![MaterialDef {
                name: "air".to_string(),
                occluding: false,
            }],
            name_to_id,
        }
    }

    /// Creates a registry with the built-in materials at their constant ids.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, occluding) in [
            ("stone", true),
            ("dirt", true),
            ("grass", true),
            ("glass", false),
            ("water", false),
            ("obsidian", true),
        ] {
            // Names above are unique and far below the id limit.
            let _ = registry.register(MaterialDef {
                name: name.to_string(),
                occluding,
            });
        }
        registry
    }

    /// Registers a material and returns its sequential id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if the name is taken, or
    /// [`RegistryError::RegistryFull`] once every id is used.
    pub fn register(&mut self, def: MaterialDef) -> Result<Material, RegistryError> {
        if self.name_to_id.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        if self.materials.len() > u16::MAX as usize {
            return Err(RegistryError::RegistryFull);
        }

        let id = Material(self.materials.len() as u16);
        self.name_to_id.insert(def.name.clone(), id);
        self.materials.push(def);
        Ok(id)
    }

    pub fn get(&self, id: Material) -> Option<&MaterialDef> {
        self.materials.get(id.0 as usize)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Material> {
        self.name_to_id.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    /// Returns `true` if only air is registered.
    pub fn is_empty(&self) -> bool {
        self.materials.len() <= 1
    }

    /// Unknown ids count as occluding.
    pub fn is_occluding(&self, id: Material) -> bool {
        self.get(id).is_none_or(|def| def.occluding)
    }

    /// Builds the full observable state of a block from its raw parts.
    pub fn state(&self, material: Material, data: u8) -> BlockState {
        BlockState {
            material,
            data,
            occludes: self.is_occluding(material),
        }
    }

    /// Decodes a combined id received from a remote server.
    pub fn decode(&self, combined: u32) -> BlockState {
        let (material, data) = BlockState::split_combined(combined);
        self.state(material, data)
    }
}

impl Default for MaterialRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// BlockState
// ---------------------------------------------------------------------------

/// Observable state of one block position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockState {
    pub material: Material,
    /// Auxiliary per-block value (orientation, growth stage, ...).
    pub data: u8,
    /// Derived from the material; never sent over the wire.
    pub occludes: bool,
}

impl BlockState {
    /// Wire encoding: `(material << 8) | data`.
    pub fn combined_id(self) -> u32 {
        ((self.material.0 as u32) << 8) | self.data as u32
    }

    /// Splits a combined id into material and data value.
    pub fn split_combined(combined: u32) -> (Material, u8) {
        (Material((combined >> 8) as u16), (combined & 0xFF) as u8)
    }
}
