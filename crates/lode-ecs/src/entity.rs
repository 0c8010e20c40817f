//! Entity identifiers, allocation, and the sparse index.
//!
//! An [`Entity`] is a 32-bit identifier issued monotonically by an
//! [`EntityAllocator`], starting at 1. Identifiers are never reused during the
//! lifetime of a registry, so a destroyed entity can never alias a newer one.
//!
//! The [`SparseIndex`] maps identifiers to their current storage location. It
//! is a sparse array of dense positions plus a dense array of values, giving
//! O(1) insert, lookup and removal while keeping iteration proportional to the
//! number of live entities.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::EcsError;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Opaque entity identifier. `0` is the null entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(u32);

impl Entity {
    /// Never issued by an allocator.
    pub const NULL: Entity = Entity(0);

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The entity `n` identifiers after this one. Batch creation issues
    /// consecutive identifiers, so this walks a batch.
    #[inline]
    pub fn offset(self, n: u32) -> Entity {
        Entity(self.0 + n)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Issues fresh, never-reused identifiers.
#[derive(Debug)]
pub struct EntityAllocator {
    next: u32,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Reserve `count` consecutive identifiers and return the first.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityIdsExhausted`] if the 32-bit space would overflow.
    pub fn allocate_range(&mut self, count: u32) -> Result<Entity, EcsError> {
        let first = self.next;
        self.next = first
            .checked_add(count)
            .ok_or(EcsError::EntityIdsExhausted)?;
        Ok(Entity(first))
    }

    /// Number of identifiers issued so far.
    pub fn issued(&self) -> u32 {
        self.next - 1
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SparseIndex
// ---------------------------------------------------------------------------

/// Dense map from [`Entity`] to `V`.
///
/// Lookups index a sparse `u32` array by entity value. That array grows to
/// the highest entity ever inserted and never shrinks, and since ids are not
/// reused it costs 4 bytes per issued id, destroyed ones included. Values
/// themselves stay packed in the dense array.
#[derive(Debug, Clone)]
pub struct SparseIndex<V> {
    /// Indexed by entity value; holds `dense position + 1`, `0` when absent.
    sparse: Vec<u32>,
    dense: Vec<(Entity, V)>,
}

impl<V> SparseIndex<V> {
    pub fn new() -> Self {
        Self {
            sparse: Vec::new(),
            dense: Vec::new(),
        }
    }

    #[inline]
    fn dense_position(&self, entity: Entity) -> Option<usize> {
        match self.sparse.get(entity.0 as usize) {
            Some(&slot) if slot != 0 => Some(slot as usize - 1),
            _ => None,
        }
    }

    /// Insert a new entry.
    ///
    /// # Panics
    ///
    /// Panics if `entity` is null or already present.
    pub fn insert(&mut self, entity: Entity, value: V) {
        assert!(!entity.is_null(), "cannot index the null entity");
        let index = entity.0 as usize;
        if index >= self.sparse.len() {
            self.sparse.resize(index + 1, 0);
        }
        assert!(self.sparse[index] == 0, "entity {entity} is already indexed");
        self.dense.push((entity, value));
        self.sparse[index] = self.dense.len() as u32;
    }

    #[inline]
    pub fn get(&self, entity: Entity) -> Option<&V> {
        self.dense_position(entity).map(|i| &self.dense[i].1)
    }

    #[inline]
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut V> {
        self.dense_position(entity).map(|i| &mut self.dense[i].1)
    }

    #[inline]
    pub fn contains(&self, entity: Entity) -> bool {
        self.dense_position(entity).is_some()
    }

    /// Remove an entry, moving the last dense entry into its place.
    pub fn remove(&mut self, entity: Entity) -> Option<V> {
        let position = self.dense_position(entity)?;
        self.sparse[entity.0 as usize] = 0;
        let (_, value) = self.dense.swap_remove(position);
        if let Some(&(moved, _)) = self.dense.get(position) {
            self.sparse[moved.0 as usize] = position as u32 + 1;
        }
        Some(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Live entities in unspecified order.
    pub fn keys(&self) -> impl Iterator<Item = Entity> + '_ {
        self.dense.iter().map(|(e, _)| *e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Entity, &V)> + '_ {
        self.dense.iter().map(|(e, v)| (*e, v))
    }
}

impl<V> Default for SparseIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_is_monotonic() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate_range(1).unwrap();
        let b = alloc.allocate_range(3).unwrap();
        let c = alloc.allocate_range(1).unwrap();
        assert_eq!(a.to_raw(), 1);
        assert_eq!(b.to_raw(), 2);
        assert_eq!(c.to_raw(), 5);
        assert_eq!(b.offset(2).to_raw(), 4);
        assert_eq!(alloc.issued(), 5);
    }

    #[test]
    fn allocator_reports_exhaustion() {
        let mut alloc = EntityAllocator::new();
        alloc.allocate_range(u32::MAX - 2).unwrap();
        assert!(matches!(
            alloc.allocate_range(2),
            Err(EcsError::EntityIdsExhausted)
        ));
    }

    #[test]
    fn sparse_array_keeps_its_high_water_mark() {
        let mut index = SparseIndex::new();
        index.insert(Entity::from_raw(1000), ());
        assert_eq!(index.sparse.len(), 1001);
        index.remove(Entity::from_raw(1000));
        assert!(index.is_empty());
        assert_eq!(index.sparse.len(), 1001);
        index.insert(Entity::from_raw(3), ());
        assert_eq!(index.sparse.len(), 1001);
    }

    #[test]
    fn sparse_index_insert_get_remove() {
        let mut index = SparseIndex::new();
        let e1 = Entity::from_raw(1);
        let e7 = Entity::from_raw(7);
        let e3 = Entity::from_raw(3);
        index.insert(e1, "one");
        index.insert(e7, "seven");
        index.insert(e3, "three");
        assert_eq!(index.len(), 3);

        assert_eq!(index.remove(e1), Some("one"));
        assert!(!index.contains(e1));
        assert_eq!(index.get(e7), Some(&"seven"));
        assert_eq!(index.get(e3), Some(&"three"));
        assert_eq!(index.remove(e1), None);

        *index.get_mut(e3).unwrap() = "THREE";
        assert_eq!(index.get(e3), Some(&"THREE"));

        let mut keys: Vec<_> = index.keys().collect();
        keys.sort();
        assert_eq!(keys, vec![e3, e7]);
    }

    #[test]
    fn unknown_and_out_of_range_entities_are_absent() {
        let index: SparseIndex<u8> = SparseIndex::new();
        assert!(index.get(Entity::from_raw(1_000)).is_none());
        assert!(!index.contains(Entity::NULL));
    }

    #[test]
    #[should_panic(expected = "already indexed")]
    fn double_insert_panics() {
        let mut index = SparseIndex::new();
        index.insert(Entity::from_raw(2), ());
        index.insert(Entity::from_raw(2), ());
    }

    #[test]
    fn entity_serializes_as_raw_value() {
        let json = serde_json::to_string(&Entity::from_raw(42)).unwrap();
        assert_eq!(json, "42");
        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Entity::from_raw(42));
    }
}
