//! Fixed-width bitsets over registered type handles.
//!
//! A [`TypeSet`] is the identity key of an archetype: two archetypes are the
//! same iff their component sets and tag sets are equal. Handles are small
//! integers handed out by the [`TypeRegistry`](crate::type_registry::TypeRegistry),
//! so a set is just a bitset indexed by handle value.

use std::fmt;

use crate::type_registry::{ComponentType, TagType};

/// Number of bits in a [`TypeSet`]. Handle `0` is reserved as invalid, so a
/// registry can hold at most `MAX_COMPONENT_TYPES` component types and the
/// same number of tag types.
pub const TYPE_SET_BITS: usize = 128;

/// Maximum number of component (or tag) types a registry accepts.
pub const MAX_COMPONENT_TYPES: u32 = TYPE_SET_BITS as u32 - 1;

const WORDS: usize = TYPE_SET_BITS / 64;

// ---------------------------------------------------------------------------
// TypeSet
// ---------------------------------------------------------------------------

/// An unordered set of type handles, stored as a bitset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeSet {
    bits: [u64; WORDS],
}

impl TypeSet {
    /// The empty set.
    pub const EMPTY: TypeSet = TypeSet { bits: [0; WORDS] };

    /// Create an empty set.
    #[inline]
    pub fn new() -> Self {
        Self::EMPTY
    }

    /// Insert a handle value.
    ///
    /// # Panics
    ///
    /// Panics if `index >= TYPE_SET_BITS`.
    #[inline]
    pub fn add(&mut self, index: u32) {
        let index = index as usize;
        assert!(index < TYPE_SET_BITS, "type handle {index} exceeds type set capacity");
        self.bits[index / 64] |= 1u64 << (index % 64);
    }

    /// Remove a handle value. Removing an absent value is a no-op.
    #[inline]
    pub fn remove(&mut self, index: u32) {
        let index = index as usize;
        if index < TYPE_SET_BITS {
            self.bits[index / 64] &= !(1u64 << (index % 64));
        }
    }

    #[inline]
    pub fn contains(&self, index: u32) -> bool {
        let index = index as usize;
        index < TYPE_SET_BITS && self.bits[index / 64] & (1u64 << (index % 64)) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of handles in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// `self ∪ other`.
    #[inline]
    pub fn union(&self, other: &TypeSet) -> TypeSet {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
        out
    }

    /// `self ∖ other`.
    #[inline]
    pub fn difference(&self, other: &TypeSet) -> TypeSet {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a &= !*b;
        }
        out
    }

    /// `self ∩ other`.
    #[inline]
    pub fn intersection(&self, other: &TypeSet) -> TypeSet {
        let mut out = *self;
        for (a, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *a &= *b;
        }
        out
    }

    /// Whether every handle in `other` is also in `self`.
    #[inline]
    pub fn is_superset_of(&self, other: &TypeSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .all(|(a, b)| a & b == *b)
    }

    /// Whether the two sets share at least one handle.
    #[inline]
    pub fn intersects(&self, other: &TypeSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Iterate handle values in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter().enumerate().flat_map(|(word_index, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros();
                remaining &= remaining - 1;
                Some(word_index as u32 * 64 + bit)
            })
        })
    }
}

impl fmt::Debug for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<u32> for TypeSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = TypeSet::new();
        for index in iter {
            set.add(index);
        }
        set
    }
}

// ---------------------------------------------------------------------------
// ComponentAndTagSets
// ---------------------------------------------------------------------------

/// The full identity key of an archetype: its component set plus its tag set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct ComponentAndTagSets {
    pub components: TypeSet,
    pub tags: TypeSet,
}

impl ComponentAndTagSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper adding a component type.
    pub fn with_component(mut self, component: ComponentType) -> Self {
        self.add_component(component);
        self
    }

    /// Builder-style helper adding a tag type.
    pub fn with_tag(mut self, tag: TagType) -> Self {
        self.add_tag(tag);
        self
    }

    #[inline]
    pub fn add_component(&mut self, component: ComponentType) {
        self.components.add(component.index());
    }

    #[inline]
    pub fn add_tag(&mut self, tag: TagType) {
        self.tags.add(tag.index());
    }

    #[inline]
    pub fn has_component(&self, component: ComponentType) -> bool {
        self.components.contains(component.index())
    }

    #[inline]
    pub fn has_tag(&self, tag: TagType) -> bool {
        self.tags.contains(tag.index())
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty() && self.tags.is_empty()
    }

    pub fn union(&self, other: &Self) -> Self {
        Self {
            components: self.components.union(&other.components),
            tags: self.tags.union(&other.tags),
        }
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self {
            components: self.components.difference(&other.components),
            tags: self.tags.difference(&other.tags),
        }
    }

    pub fn is_superset_of(&self, other: &Self) -> bool {
        self.components.is_superset_of(&other.components) && self.tags.is_superset_of(&other.tags)
    }

    /// Whether `self` shares any component or tag with `other`.
    pub fn intersects(&self, other: &Self) -> bool {
        self.components.intersects(&other.components) || self.tags.intersects(&other.tags)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
