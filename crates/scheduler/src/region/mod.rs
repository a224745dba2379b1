//! Spatial ownership: which execution context owns a location or entity.
//!
//! - `ownership`: versioned copy-on-write map of chunk and entity ownership
//! - `resolver`: the [`RegionResolver`] seam consulted by the backends

pub mod ownership;
pub mod resolver;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use ownership::{OwnershipMap, OwnershipSnapshot};
pub use resolver::{FixedResolver, RegionResolver, Resolution};

/// Side length of a chunk in world cells.
pub const CHUNK_SIZE: i32 = 16;

/// A 16x16 column of world cells; the unit of region ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub world: String,
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(world: impl Into<String>, x: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            z,
        }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {}]", self.world, self.x, self.z)
    }
}

/// A point in a world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    /// The chunk containing this location.
    pub fn chunk(&self) -> ChunkPos {
        let cell_x = self.x.floor() as i32;
        let cell_z = self.z.floor() as i32;
        ChunkPos {
            world: self.world.clone(),
            x: cell_x.div_euclid(CHUNK_SIZE),
            z: cell_z.div_euclid(CHUNK_SIZE),
        }
    }
}

/// Identity of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

/// What a region-affine task is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerRef {
    Chunk(ChunkPos),
    /// Follows the entity: resolves through the chunk it was last placed in.
    Entity(EntityId),
}

impl From<ChunkPos> for OwnerRef {
    fn from(chunk: ChunkPos) -> Self {
        OwnerRef::Chunk(chunk)
    }
}

impl From<&Location> for OwnerRef {
    fn from(location: &Location) -> Self {
        OwnerRef::Chunk(location.chunk())
    }
}

impl From<Location> for OwnerRef {
    fn from(location: Location) -> Self {
        OwnerRef::Chunk(location.chunk())
    }
}

impl From<EntityId> for OwnerRef {
    fn from(entity: EntityId) -> Self {
        OwnerRef::Entity(entity)
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerRef::Chunk(chunk) => chunk.fmt(f),
            OwnerRef::Entity(entity) => entity.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_maps_to_chunk() {
        assert_eq!(
            Location::new("world", 0.0, 64.0, 15.9).chunk(),
            ChunkPos::new("world", 0, 0)
        );
        assert_eq!(
            Location::new("world", 16.0, 64.0, 33.0).chunk(),
            ChunkPos::new("world", 1, 2)
        );
    }

    #[test]
    fn negative_coordinates_floor_toward_negative_infinity() {
        assert_eq!(
            Location::new("nether", -0.5, 10.0, -16.0).chunk(),
            ChunkPos::new("nether", -1, -1)
        );
        assert_eq!(
            Location::new("nether", -17.0, 10.0, -1.0).chunk(),
            ChunkPos::new("nether", -2, -1)
        );
    }

    #[test]
    fn owner_ref_display() {
        let owner: OwnerRef = ChunkPos::new("world", 3, -4).into();
        assert_eq!(owner.to_string(), "world[3, -4]");
    }
}
