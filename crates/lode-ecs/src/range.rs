//! Typed per-chunk range iteration.
//!
//! A range walks every archetype whose type set contains the query signature
//! and yields one item per non-empty chunk: the chunk's entity slice plus one
//! column slice per query item.
//!
//! ```
//! use lode_ecs::prelude::*;
//!
//! #[derive(Default, Debug, PartialEq)]
//! struct Position(f32);
//! impl Component for Position {}
//!
//! #[derive(Default)]
//! struct Velocity(f32);
//! impl Component for Velocity {}
//!
//! let mut registry = EntityRegistry::new(TypeRegistry::new());
//! let e = registry.create_with::<(Position, Velocity)>(1).unwrap();
//! registry.get_mut::<Velocity>(e).0 = 2.0;
//!
//! for (_entities, (positions, velocities)) in registry.range_mut::<(&mut Position, &Velocity)>() {
//!     for (p, v) in positions.iter_mut().zip(velocities) {
//!         p.0 += v.0;
//!     }
//! }
//! assert_eq!(registry.get::<Position>(e), &Position(2.0));
//! ```
//!
//! ## Soundness
//!
//! Shared ranges come from [`EntityRegistry::range`], which takes `&self` and
//! refuses signatures containing `&mut T`. Mutable ranges come from
//! [`EntityRegistry::range_mut`], which takes `&mut self` and refuses
//! signatures naming the same component twice when either access is mutable.
//! Column slices of distinct components never overlap, so the slices handed
//! out for one chunk are disjoint.

use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr;

use crate::archetype::ArchetypeId;
use crate::entity::Entity;
use crate::registry::EntityRegistry;
use crate::type_registry::{Component, ComponentType, TypeHandle, TypeRegistry};
use crate::type_set::ComponentAndTagSets;

// ---------------------------------------------------------------------------
// QueryItem -- one element of a query signature
// ---------------------------------------------------------------------------

/// One element of a query signature: `&T` (read) or `&mut T` (write).
pub trait QueryItem {
    type Component: Component;
    /// Column view for a whole chunk.
    type Slice<'w>;
    /// View of a single value.
    type Ref<'w>;
    const MUTABLE: bool;

    /// # Safety
    ///
    /// `base` must point at `len` initialized values of `Self::Component`
    /// that stay valid, and unaliased if mutable, for `'w`.
    unsafe fn slice<'w>(base: *mut u8, len: usize) -> Self::Slice<'w>;

    /// # Safety
    ///
    /// Same as [`slice`](Self::slice) with `len == 1`.
    unsafe fn value<'w>(ptr: *mut u8) -> Self::Ref<'w>;
}

impl<T: Component> QueryItem for &T {
    type Component = T;
    type Slice<'w> = &'w [T];
    type Ref<'w> = &'w T;
    const MUTABLE: bool = false;

    unsafe fn slice<'w>(base: *mut u8, len: usize) -> Self::Slice<'w> {
        std::slice::from_raw_parts(base as *const T, len)
    }

    unsafe fn value<'w>(ptr: *mut u8) -> Self::Ref<'w> {
        &*(ptr as *const T)
    }
}

impl<T: Component> QueryItem for &mut T {
    type Component = T;
    type Slice<'w> = &'w mut [T];
    type Ref<'w> = &'w mut T;
    const MUTABLE: bool = true;

    unsafe fn slice<'w>(base: *mut u8, len: usize) -> Self::Slice<'w> {
        std::slice::from_raw_parts_mut(base as *mut T, len)
    }

    unsafe fn value<'w>(ptr: *mut u8) -> Self::Ref<'w> {
        &mut *(ptr as *mut T)
    }
}

// ---------------------------------------------------------------------------
// Query -- a tuple of QueryItems
// ---------------------------------------------------------------------------

/// A query signature: a tuple of one to four [`QueryItem`]s.
pub trait Query {
    type Slices<'w>;
    type Refs<'w>;
    const HAS_MUTABLE: bool;

    /// `(mutable, TypeId)` for each item, in signature order.
    fn access() -> Vec<(bool, TypeId)>;

    /// Resolve each item's component handle. `None` if any is unregistered.
    fn components(types: &TypeRegistry) -> Option<Vec<ComponentType>>;

    /// # Safety
    ///
    /// `columns` holds one base pointer per item, in signature order, each
    /// addressing `len` initialized values; the access rules of
    /// [`QueryItem::slice`] apply.
    unsafe fn slices<'w>(columns: &[*mut u8], len: usize) -> Self::Slices<'w>;

    /// # Safety
    ///
    /// `values` holds one pointer per item, in signature order; the access
    /// rules of [`QueryItem::value`] apply.
    unsafe fn values<'w>(values: &[*mut u8]) -> Self::Refs<'w>;
}

/// Panics if one component type is accessed mutably more than once, or both
/// mutably and immutably.
pub(crate) fn validate_no_access_conflicts(items: &[(bool, TypeId)]) {
    let mut mutable_ids: Vec<TypeId> = Vec::new();
    let mut read_ids: Vec<TypeId> = Vec::new();
    for &(is_mutable, id) in items {
        if is_mutable {
            if mutable_ids.contains(&id) {
                panic!("query contains duplicate mutable access to the same component type");
            }
            if read_ids.contains(&id) {
                panic!("query contains overlapping read and mutable access to the same component type");
            }
            mutable_ids.push(id);
        } else {
            if mutable_ids.contains(&id) {
                panic!("query contains overlapping read and mutable access to the same component type");
            }
            read_ids.push(id);
        }
    }
}

macro_rules! impl_query {
    ($(($item:ident, $index:tt)),+) => {
        impl<$($item: QueryItem),+> Query for ($($item,)+) {
            type Slices<'w> = ($($item::Slice<'w>,)+);
            type Refs<'w> = ($($item::Ref<'w>,)+);
            const HAS_MUTABLE: bool = false $(|| $item::MUTABLE)+;

            fn access() -> Vec<(bool, TypeId)> {
                vec![$(($item::MUTABLE, TypeId::of::<$item::Component>())),+]
            }

            fn components(types: &TypeRegistry) -> Option<Vec<ComponentType>> {
                Some(vec![$(types.component_of::<$item::Component>()?),+])
            }

            unsafe fn slices<'w>(columns: &[*mut u8], len: usize) -> Self::Slices<'w> {
                ($($item::slice(columns[$index], len),)+)
            }

            unsafe fn values<'w>(values: &[*mut u8]) -> Self::Refs<'w> {
                ($($item::value(values[$index]),)+)
            }
        }
    };
}

impl_query!((A, 0));
impl_query!((A, 0), (B, 1));
impl_query!((A, 0), (B, 1), (C, 2));
impl_query!((A, 0), (B, 1), (C, 2), (D, 3));

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Extra required / excluded types attached to a range.
#[derive(Debug, Clone, Copy, Default)]
struct Filter {
    required: ComponentAndTagSets,
    excluded: ComponentAndTagSets,
    /// A required type is not registered, so nothing can match.
    unsatisfiable: bool,
}

impl Filter {
    fn require<T: 'static>(&mut self, types: &TypeRegistry) {
        match types.handle_of::<T>() {
            Some(TypeHandle::Component(c)) => self.required.add_component(c),
            Some(TypeHandle::Tag(t)) => self.required.add_tag(t),
            None => self.unsatisfiable = true,
        }
    }

    fn exclude<T: 'static>(&mut self, types: &TypeRegistry) {
        // An unregistered type is on no entity, so excluding it is a no-op.
        match types.handle_of::<T>() {
            Some(TypeHandle::Component(c)) => self.excluded.add_component(c),
            Some(TypeHandle::Tag(t)) => self.excluded.add_tag(t),
            None => {}
        }
    }
}

// ---------------------------------------------------------------------------
// ChunkCursor -- shared traversal state
// ---------------------------------------------------------------------------

struct ChunkCursor<'w> {
    registry: &'w EntityRegistry,
    signature: Vec<ComponentType>,
    archetypes: Vec<ArchetypeId>,
    arch_cursor: usize,
    chunk_cursor: usize,
    /// Column index of each signature component in the current archetype.
    columns: Vec<usize>,
    pointers: Vec<*mut u8>,
}

impl<'w> ChunkCursor<'w> {
    fn new<Q: Query>(registry: &'w EntityRegistry, filter: &Filter) -> Self {
        let resolved = if filter.unsatisfiable {
            None
        } else {
            Q::components(registry.types())
        };
        let (signature, archetypes) = match resolved {
            Some(signature) => {
                let mut required = filter.required;
                for component in &signature {
                    required.add_component(*component);
                }
                let archetypes = registry.matching_archetypes(&required, &filter.excluded);
                (signature, archetypes)
            }
            None => (Vec::new(), Vec::new()),
        };
        let width = signature.len();
        Self {
            registry,
            signature,
            archetypes,
            arch_cursor: 0,
            chunk_cursor: 0,
            columns: Vec::with_capacity(width),
            pointers: vec![ptr::null_mut(); width],
        }
    }

    /// Advance to the next non-empty chunk. Fills `self.pointers` with the
    /// column bases and returns the chunk's entities.
    fn next_chunk(&mut self) -> Option<&'w [Entity]> {
        loop {
            let id = *self.archetypes.get(self.arch_cursor)?;
            let archetype = self.registry.archetype(id);
            if self.chunk_cursor == 0 {
                self.columns.clear();
                for component in &self.signature {
                    match archetype.find_component_index(*component) {
                        Some(column) => self.columns.push(column),
                        None => unreachable!("matched archetype lacks {component:?}"),
                    }
                }
            }
            if self.chunk_cursor >= archetype.used_chunk_count() {
                self.arch_cursor += 1;
                self.chunk_cursor = 0;
                continue;
            }
            let data = archetype.fetch_chunk_data(
                self.registry.pool(),
                self.chunk_cursor,
                &self.columns,
                &mut self.pointers,
            );
            self.chunk_cursor += 1;
            if data.len == 0 {
                continue;
            }
            // Safety: the first `len` entity slots of a chunk are initialized,
            // and the registry is borrowed for 'w.
            return Some(unsafe { std::slice::from_raw_parts(data.entities, data.len) });
        }
    }

    fn count_rows(&self) -> usize {
        self.archetypes
            .iter()
            .map(|id| self.registry.archetype(*id).len())
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Range (shared)
// ---------------------------------------------------------------------------

/// Lazy shared traversal built by [`EntityRegistry::range`].
///
/// Cheap to build; every call to [`iter`](Self::iter) or `into_iter` starts a
/// fresh pass.
pub struct Range<'w, Q: Query> {
    registry: &'w EntityRegistry,
    filter: Filter,
    _marker: PhantomData<Q>,
}

impl<'w, Q: Query> Range<'w, Q> {
    pub(crate) fn new(registry: &'w EntityRegistry) -> Self {
        Self {
            registry,
            filter: Filter::default(),
            _marker: PhantomData,
        }
    }

    /// Only visit entities that also have `T` (component or tag).
    pub fn with<T: 'static>(mut self) -> Self {
        self.filter.require::<T>(self.registry.types());
        self
    }

    /// Skip entities that have `T` (component or tag).
    pub fn without<T: 'static>(mut self) -> Self {
        self.filter.exclude::<T>(self.registry.types());
        self
    }

    pub fn iter(&self) -> RangeIter<'w, Q> {
        RangeIter {
            cursor: ChunkCursor::new::<Q>(self.registry, &self.filter),
            _marker: PhantomData,
        }
    }

    /// Number of entities the traversal would visit.
    pub fn count_rows(&self) -> usize {
        ChunkCursor::new::<Q>(self.registry, &self.filter).count_rows()
    }

    /// Call `f` once per entity with references to its queried components.
    pub fn for_each_row(&self, mut f: impl FnMut(Entity, Q::Refs<'w>)) {
        let mut cursor = ChunkCursor::new::<Q>(self.registry, &self.filter);
        for_each_row_in::<Q>(&mut cursor, &mut f);
    }
}

impl<'w, Q: Query> IntoIterator for Range<'w, Q> {
    type Item = (&'w [Entity], Q::Slices<'w>);
    type IntoIter = RangeIter<'w, Q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, 'w, Q: Query> IntoIterator for &'a Range<'w, Q> {
    type Item = (&'w [Entity], Q::Slices<'w>);
    type IntoIter = RangeIter<'w, Q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the chunks of a [`Range`].
pub struct RangeIter<'w, Q: Query> {
    cursor: ChunkCursor<'w>,
    _marker: PhantomData<Q>,
}

impl<'w, Q: Query> Iterator for RangeIter<'w, Q> {
    type Item = (&'w [Entity], Q::Slices<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        let entities = self.cursor.next_chunk()?;
        // Safety: the query has no mutable items (checked when the range was
        // built), and the columns hold `entities.len()` initialized values.
        let slices = unsafe { Q::slices(&self.cursor.pointers, entities.len()) };
        Some((entities, slices))
    }
}

// ---------------------------------------------------------------------------
// RangeMut (exclusive)
// ---------------------------------------------------------------------------

/// Lazy exclusive traversal built by [`EntityRegistry::range_mut`].
///
/// Holds the registry's exclusive borrow for `'w`; the shared reference
/// inside is only a handle for address computation.
pub struct RangeMut<'w, Q: Query> {
    registry: &'w EntityRegistry,
    filter: Filter,
    _marker: PhantomData<(Q, &'w mut EntityRegistry)>,
}

impl<'w, Q: Query> RangeMut<'w, Q> {
    pub(crate) fn new(registry: &'w mut EntityRegistry) -> Self {
        Self {
            registry,
            filter: Filter::default(),
            _marker: PhantomData,
        }
    }

    pub fn with<T: 'static>(mut self) -> Self {
        self.filter.require::<T>(self.registry.types());
        self
    }

    pub fn without<T: 'static>(mut self) -> Self {
        self.filter.exclude::<T>(self.registry.types());
        self
    }

    pub fn count_rows(&self) -> usize {
        ChunkCursor::new::<Q>(self.registry, &self.filter).count_rows()
    }

    /// Call `f` once per entity with references to its queried components.
    pub fn for_each_row(self, mut f: impl FnMut(Entity, Q::Refs<'w>)) {
        let mut cursor = ChunkCursor::new::<Q>(self.registry, &self.filter);
        for_each_row_in::<Q>(&mut cursor, &mut f);
    }
}

impl<'w, Q: Query> IntoIterator for RangeMut<'w, Q> {
    type Item = (&'w [Entity], Q::Slices<'w>);
    type IntoIter = RangeIterMut<'w, Q>;

    fn into_iter(self) -> Self::IntoIter {
        RangeIterMut {
            cursor: ChunkCursor::new::<Q>(self.registry, &self.filter),
            _marker: PhantomData,
        }
    }
}

/// Iterator over the chunks of a [`RangeMut`].
pub struct RangeIterMut<'w, Q: Query> {
    cursor: ChunkCursor<'w>,
    _marker: PhantomData<(Q, &'w mut EntityRegistry)>,
}

impl<'w, Q: Query> Iterator for RangeIterMut<'w, Q> {
    type Item = (&'w [Entity], Q::Slices<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        let entities = self.cursor.next_chunk()?;
        // Safety: the registry is exclusively borrowed for 'w, each chunk is
        // yielded once, and access conflicts were rejected up front.
        let slices = unsafe { Q::slices(&self.cursor.pointers, entities.len()) };
        Some((entities, slices))
    }
}

fn for_each_row_in<'w, Q: Query>(
    cursor: &mut ChunkCursor<'w>,
    f: &mut impl FnMut(Entity, Q::Refs<'w>),
) {
    let mut row_pointers = vec![ptr::null_mut(); cursor.signature.len()];
    while let Some(entities) = cursor.next_chunk() {
        let archetype = cursor
            .registry
            .archetype(cursor.archetypes[cursor.arch_cursor]);
        for (row, entity) in entities.iter().enumerate() {
            for (i, column) in cursor.columns.iter().enumerate() {
                let size = archetype.columns()[*column].size as usize;
                // Safety: row < chunk length, so the address is in the column.
                row_pointers[i] = unsafe { cursor.pointers[i].add(row * size) };
            }
            // Safety: see the iterator impls; each row is visited once.
            f(*entity, unsafe { Q::values(&row_pointers) });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }
    impl Component for Pos {}

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }
    impl Component for Vel {}

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Health(u32);
    impl Component for Health {}

    #[derive(Default)]
    struct Frozen;
    impl Component for Frozen {
        const KIND: TypeKind = TypeKind::Tag;
    }

    fn setup() -> EntityRegistry {
        let mut registry = EntityRegistry::new(TypeRegistry::new());
        registry.register::<Pos>().unwrap();
        registry.register::<Vel>().unwrap();
        registry.register::<Health>().unwrap();
        registry.register::<Frozen>().unwrap();
        registry
    }

    #[test]
    fn range_visits_matching_archetypes_only() {
        let mut registry = setup();
        let moving = registry.create_with::<(Pos, Vel)>(3).unwrap();
        registry.create_with::<(Pos,)>(2).unwrap();
        registry.create_with::<(Vel,)>(4).unwrap();

        let mut seen = Vec::new();
        for (entities, (positions, velocities)) in registry.range::<(&Pos, &Vel)>() {
            assert_eq!(entities.len(), positions.len());
            assert_eq!(entities.len(), velocities.len());
            seen.extend_from_slice(entities);
        }
        seen.sort();
        assert_eq!(seen, vec![moving, moving.offset(1), moving.offset(2)]);

        assert_eq!(registry.range::<(&Pos,)>().count_rows(), 5);
        assert_eq!(registry.range::<(&Vel,)>().count_rows(), 7);
    }

    #[test]
    fn range_mut_writes_through_slices() {
        let mut registry = setup();
        let e = registry.create_with::<(Pos, Vel)>(1).unwrap();
        *registry.get_mut::<Vel>(e) = Vel { dx: 1.0, dy: 2.0 };

        for (_, (positions, velocities)) in registry.range_mut::<(&mut Pos, &Vel)>() {
            for (p, v) in positions.iter_mut().zip(velocities.iter()) {
                p.x += v.dx;
                p.y += v.dy;
            }
        }
        assert_eq!(registry.get::<Pos>(e), &Pos { x: 1.0, y: 2.0 });
    }

    #[test]
    fn filters_by_tag_and_exclusion() {
        let mut registry = setup();
        let frozen = registry.create_with::<(Pos, Frozen)>(2).unwrap();
        let free = registry.create_with::<(Pos,)>(3).unwrap();
        registry.create_with::<(Pos, Health)>(1).unwrap();

        let only_frozen: Vec<Entity> = registry
            .range::<(&Pos,)>()
            .with::<Frozen>()
            .into_iter()
            .flat_map(|(entities, _)| entities.iter().copied())
            .collect();
        assert_eq!(only_frozen, vec![frozen, frozen.offset(1)]);

        let plain = registry
            .range::<(&Pos,)>()
            .without::<Frozen>()
            .without::<Health>();
        assert_eq!(plain.count_rows(), 3);
        let first_chunk = plain.iter().next().unwrap();
        assert_eq!(first_chunk.0[0], free);
    }

    #[test]
    fn unregistered_types_give_empty_traversal() {
        #[derive(Default)]
        struct Unknown;
        impl Component for Unknown {}

        let mut registry = setup();
        registry.create_with::<(Pos,)>(5).unwrap();
        assert_eq!(registry.range::<(&Unknown,)>().into_iter().count(), 0);
        assert_eq!(registry.range::<(&Pos, &Unknown)>().count_rows(), 0);
        assert_eq!(registry.range::<(&Pos,)>().with::<Unknown>().count_rows(), 0);
        assert_eq!(registry.range::<(&Pos,)>().without::<Unknown>().count_rows(), 5);
    }

    #[test]
    fn range_is_restartable() {
        let mut registry = setup();
        registry.create_with::<(Health,)>(10).unwrap();
        let range = registry.range::<(&Health,)>();
        let first: usize = range.iter().map(|(e, _)| e.len()).sum();
        let second: usize = (&range).into_iter().map(|(e, _)| e.len()).sum();
        assert_eq!(first, 10);
        assert_eq!(second, 10);
    }

    #[test]
    fn for_each_row_visits_every_entity() {
        let mut registry = setup();
        let first = registry.create_with::<(Health,)>(4).unwrap();
        registry.create_with::<(Health, Pos)>(2).unwrap();

        registry
            .range_mut::<(&mut Health,)>()
            .for_each_row(|entity, (health,)| health.0 = entity.to_raw() * 10);

        let mut total = 0;
        registry
            .range::<(&Health,)>()
            .for_each_row(|entity, (health,)| {
                assert_eq!(health.0, entity.to_raw() * 10);
                total += 1;
            });
        assert_eq!(total, 6);
        assert_eq!(registry.get::<Health>(first).0, 10);
    }

    #[test]
    fn yields_one_item_per_chunk() {
        let mut registry = setup();
        registry.create_with::<(Pos,)>(1).unwrap();
        let pos = registry.types().component_of::<Pos>().unwrap();
        let capacity = registry
            .archetypes()
            .find(|a| a.has_component(pos))
            .unwrap()
            .entities_per_chunk();
        registry.create_with::<(Pos,)>(capacity).unwrap();

        let lens: Vec<usize> = registry
            .range::<(&Pos,)>()
            .into_iter()
            .map(|(entities, _)| entities.len())
            .collect();
        assert_eq!(lens, vec![capacity as usize, 1]);
    }

    #[test]
    #[should_panic(expected = "cannot be used with mutable query items")]
    fn range_rejects_mutable_items() {
        let mut registry = setup();
        registry.create_with::<(Pos,)>(1).unwrap();
        let _ = registry.range::<(&mut Pos,)>().into_iter().count();
    }

    #[test]
    #[should_panic(expected = "duplicate mutable access")]
    fn range_mut_rejects_duplicate_mutable_items() {
        let mut registry = setup();
        let _ = registry.range_mut::<(&mut Pos, &mut Pos)>();
    }

    #[test]
    #[should_panic(expected = "overlapping read and mutable access")]
    fn range_mut_rejects_read_write_overlap() {
        let mut registry = setup();
        let _ = registry.range_mut::<(&Pos, &mut Pos)>();
    }
}
