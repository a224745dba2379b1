use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::ContextId;
use crate::error::{LockResultExt, SchedulerError};

use super::resolver::{RegionResolver, Resolution};
use super::{ChunkPos, EntityId, OwnerRef};

/// Immutable view of who owns what, tagged with a version that increases
/// on every topology change.
#[derive(Debug, Clone, Default)]
pub struct OwnershipSnapshot {
    version: u64,
    chunks: HashMap<ChunkPos, ContextId>,
    entities: HashMap<EntityId, ChunkPos>,
}

impl OwnershipSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn owner_of_chunk(&self, chunk: &ChunkPos) -> Option<ContextId> {
        self.chunks.get(chunk).copied()
    }

    pub fn owner_of_entity(&self, entity: &EntityId) -> Option<ContextId> {
        self.entities
            .get(entity)
            .and_then(|chunk| self.owner_of_chunk(chunk))
    }

    pub fn resolve(&self, owner: &OwnerRef) -> Resolution {
        let found = match owner {
            OwnerRef::Chunk(chunk) => self.owner_of_chunk(chunk),
            OwnerRef::Entity(entity) => self.owner_of_entity(entity),
        };
        found.map_or(Resolution::Unloaded, Resolution::Owned)
    }

    /// Chunks owned by `context`, sorted.
    pub fn chunks_of(&self, context: ContextId) -> Vec<ChunkPos> {
        let mut owned: Vec<ChunkPos> = self
            .chunks
            .iter()
            .filter(|(_, owner)| **owner == context)
            .map(|(chunk, _)| chunk.clone())
            .collect();
        owned.sort();
        owned
    }

    pub fn region_count(&self) -> usize {
        let mut owners: Vec<ContextId> = self.chunks.values().copied().collect();
        owners.sort();
        owners.dedup();
        owners.len()
    }

    pub(crate) fn assign(&mut self, chunk: ChunkPos, context: ContextId) -> Option<ContextId> {
        self.chunks.insert(chunk, context)
    }

    /// Move every chunk of `from` to `into`; returns how many moved.
    pub(crate) fn reassign_all(&mut self, from: ContextId, into: ContextId) -> usize {
        let mut moved = 0;
        for owner in self.chunks.values_mut() {
            if *owner == from {
                *owner = into;
                moved += 1;
            }
        }
        moved
    }

    pub(crate) fn release_all(&mut self, context: ContextId) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|_, owner| *owner != context);
        before - self.chunks.len()
    }

    pub(crate) fn place_entity(&mut self, entity: EntityId, chunk: ChunkPos) {
        self.entities.insert(entity, chunk);
    }

    pub(crate) fn remove_entity(&mut self, entity: &EntityId) -> bool {
        self.entities.remove(entity).is_some()
    }
}

/// Copy-on-write ownership map.
///
/// Readers take a cheap `Arc` clone of the current snapshot and never block
/// each other; writers clone, modify and swap the whole snapshot, so a
/// reader always sees one consistent version.
#[derive(Debug, Default)]
pub struct OwnershipMap {
    current: RwLock<Arc<OwnershipSnapshot>>,
}

impl OwnershipMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<OwnershipSnapshot> {
        match self.current.read() {
            Ok(current) => Arc::clone(&current),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Apply `change` to a copy of the current snapshot and publish it.
    /// Nothing is published if `change` fails.
    pub(crate) fn update<R>(
        &self,
        change: impl FnOnce(&mut OwnershipSnapshot) -> Result<R, SchedulerError>,
    ) -> Result<(R, Arc<OwnershipSnapshot>), SchedulerError> {
        let mut current = self.current.write().or_poisoned("ownership map")?;
        let mut next = OwnershipSnapshot::clone(&current);
        let out = change(&mut next)?;
        next.version += 1;
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        Ok((out, next))
    }
}

impl RegionResolver for OwnershipMap {
    fn resolve(&self, owner: &OwnerRef) -> Resolution {
        self.snapshot().resolve(owner)
    }
}
