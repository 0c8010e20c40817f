//! The [`EntityRegistry`] is the top-level storage façade. It owns the type
//! registry, the chunk pool, every archetype, and the sparse index that maps
//! entities to their current row.
//!
//! Structural changes (create, destroy, add, remove) take `&mut self`;
//! references and slices handed out by `get` and `range` borrow the registry,
//! so the borrow checker rules out using them across a relocation.

use std::collections::HashMap;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::archetype::{Archetype, ArchetypeId, TagBits};
use crate::chunk_pool::{ChunkPool, PoolStats};
use crate::config::{EmptyArchetypePolicy, StorageConfig};
use crate::entity::{Entity, EntityAllocator, SparseIndex};
use crate::range::{validate_no_access_conflicts, Query, Range, RangeMut};
use crate::type_registry::{Component, ComponentType, TypeHandle, TypeRegistry};
use crate::type_set::ComponentAndTagSets;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Entity location
// ---------------------------------------------------------------------------

/// Where an entity lives: its archetype and its slot within that archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityLocation {
    pub archetype: ArchetypeId,
    pub slot: u32,
}

// ---------------------------------------------------------------------------
// TypeList -- compile-time type sets
// ---------------------------------------------------------------------------

/// A tuple of [`Component`] types (components and tags mixed), used by the
/// typed structural operations such as
/// [`create_with`](EntityRegistry::create_with).
pub trait TypeList {
    /// Register every type in the list and return the combined set.
    fn register(types: &mut TypeRegistry) -> Result<ComponentAndTagSets, EcsError>;
}

fn add_handle(sets: &mut ComponentAndTagSets, handle: TypeHandle) {
    match handle {
        TypeHandle::Component(c) => sets.add_component(c),
        TypeHandle::Tag(t) => sets.add_tag(t),
    }
}

macro_rules! impl_type_list {
    ($($ty:ident),+) => {
        impl<$($ty: Component),+> TypeList for ($($ty,)+) {
            fn register(types: &mut TypeRegistry) -> Result<ComponentAndTagSets, EcsError> {
                let mut sets = ComponentAndTagSets::new();
                $(add_handle(&mut sets, types.register::<$ty>()?);)+
                Ok(sets)
            }
        }
    };
}

impl_type_list!(A);
impl_type_list!(A, B);
impl_type_list!(A, B, C);
impl_type_list!(A, B, C, D);
impl_type_list!(A, B, C, D, E);
impl_type_list!(A, B, C, D, E, F);

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

/// Archetype-based entity/component store.
pub struct EntityRegistry {
    types: TypeRegistry,
    config: StorageConfig,
    pool: ChunkPool,
    /// Indexed by `ArchetypeId.0`; `None` for torn-down archetypes.
    archetypes: Vec<Option<Archetype>>,
    /// Vacant slots in `archetypes`, reused before growing.
    free_archetype_slots: Vec<u32>,
    /// Archetype cache keyed by exact type set.
    archetype_index: HashMap<ComponentAndTagSets, ArchetypeId>,
    allocator: EntityAllocator,
    locations: SparseIndex<EntityLocation>,
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entity_count", &self.locations.len())
            .field("archetype_count", &self.archetype_index.len())
            .field("pool", &self.pool.stats())
            .finish()
    }
}

/// Shared lookup that only borrows the archetype table, so callers can hold
/// the pool or index at the same time.
fn archetype_in(archetypes: &[Option<Archetype>], id: ArchetypeId) -> &Archetype {
    match archetypes.get(id.0 as usize) {
        Some(Some(archetype)) => archetype,
        _ => panic!("archetype {} is not live", id.0),
    }
}

fn archetype_in_mut(archetypes: &mut [Option<Archetype>], id: ArchetypeId) -> &mut Archetype {
    match archetypes.get_mut(id.0 as usize) {
        Some(Some(archetype)) => archetype,
        _ => panic!("archetype {} is not live", id.0),
    }
}

impl EntityRegistry {
    /// Create an empty registry with the default [`StorageConfig`].
    pub fn new(types: TypeRegistry) -> Self {
        Self::with_config(types, StorageConfig::default())
    }

    pub fn with_config(types: TypeRegistry, config: StorageConfig) -> Self {
        Self {
            types,
            config: config.sanitized(),
            pool: ChunkPool::new(),
            archetypes: Vec::new(),
            free_archetype_slots: Vec::new(),
            archetype_index: HashMap::new(),
            allocator: EntityAllocator::new(),
            locations: SparseIndex::new(),
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Mutable access for registering more types. Existing handles stay valid.
    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// Register a Rust type as a component or tag.
    pub fn register<T: Component>(&mut self) -> Result<TypeHandle, EcsError> {
        self.types.register::<T>()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    // -- archetype management -----------------------------------------------

    /// Find or create the archetype for an exact type set.
    fn find_or_create_archetype(
        &mut self,
        sets: &ComponentAndTagSets,
    ) -> Result<ArchetypeId, EcsError> {
        if let Some(&id) = self.archetype_index.get(sets) {
            return Ok(id);
        }
        let index = match self.free_archetype_slots.last() {
            Some(&slot) => slot,
            None => self.archetypes.len() as u32,
        };
        let id = ArchetypeId(index);
        let mut archetype = Archetype::new(id, &self.types, sets)?;
        archetype.reserve_chunks(
            &mut self.pool,
            self.config.initial_chunks_per_archetype as usize,
        );
        debug!(
            archetype = index,
            components = ?sets.components,
            tags = ?sets.tags,
            entities_per_chunk = archetype.entities_per_chunk(),
            "created archetype"
        );

        if index as usize == self.archetypes.len() {
            self.archetypes.push(Some(archetype));
        } else {
            self.free_archetype_slots.pop();
            self.archetypes[index as usize] = Some(archetype);
        }
        self.archetype_index.insert(*sets, id);
        Ok(id)
    }

    /// Apply the empty-archetype policy to `id`.
    fn release_if_empty(&mut self, id: ArchetypeId) {
        if self.config.empty_archetype_policy != EmptyArchetypePolicy::Teardown {
            return;
        }
        let slot = &mut self.archetypes[id.0 as usize];
        let Some(archetype) = slot.as_mut() else {
            return;
        };
        if !archetype.is_empty() {
            return;
        }
        let chunks = archetype.chunk_count();
        archetype.release_chunks(&mut self.pool);
        let types = *archetype.types();
        *slot = None;
        self.archetype_index.remove(&types);
        self.free_archetype_slots.push(id.0);
        debug!(archetype = id.0, chunks, "tore down empty archetype");

        if let Some(max) = self.config.max_pooled_chunks {
            self.pool.shrink_to(max as usize);
        }
    }

    pub(crate) fn archetype(&self, id: ArchetypeId) -> &Archetype {
        archetype_in(&self.archetypes, id)
    }

    /// Read-only view of the chunk pool, for inspecting chunk headers.
    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    /// Live archetypes in slot order.
    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> + '_ {
        self.archetypes.iter().flatten()
    }

    /// Live archetypes whose type set contains `required` and shares nothing
    /// with `excluded`, in slot order.
    pub(crate) fn matching_archetypes(
        &self,
        required: &ComponentAndTagSets,
        excluded: &ComponentAndTagSets,
    ) -> Vec<ArchetypeId> {
        self.archetypes()
            .filter(|a| a.types().is_superset_of(required) && !a.types().intersects(excluded))
            .map(|a| a.id())
            .collect()
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create `count` entities with the type set `sets`, all components
    /// default-constructed. Returns the first entity; the rest follow
    /// consecutively (see [`Entity::offset`]).
    ///
    /// # Errors
    ///
    /// Fails without creating anything if the archetype cannot be built
    /// (unregistered handle, row too large) or the identifier space is
    /// exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `count == 0`.
    pub fn create(&mut self, sets: &ComponentAndTagSets, count: u32) -> Result<Entity, EcsError> {
        assert!(count > 0, "create requires a non-zero entity count");
        let id = self.find_or_create_archetype(sets)?;
        let first = match self.allocator.allocate_range(count) {
            Ok(first) => first,
            Err(err) => {
                self.release_if_empty(id);
                return Err(err);
            }
        };

        let archetype = archetype_in_mut(&mut self.archetypes, id);
        let needed = (archetype.len() + count as usize)
            .div_ceil(archetype.entities_per_chunk() as usize);
        archetype.reserve_chunks(&mut self.pool, needed);
        for i in 0..count {
            let entity = first.offset(i);
            let row = archetype.insert_row(&mut self.pool, entity);
            self.locations.insert(
                entity,
                EntityLocation {
                    archetype: id,
                    slot: archetype.slot_of(row),
                },
            );
        }
        Ok(first)
    }

    /// Typed [`create`](Self::create): registers the listed types on the fly.
    pub fn create_with<L: TypeList>(&mut self, count: u32) -> Result<Entity, EcsError> {
        let sets = L::register(&mut self.types)?;
        self.create(&sets, count)
    }

    /// Destroy an entity and all of its components.
    ///
    /// # Panics
    ///
    /// Panics if `entity` is not alive. Use [`try_destroy`](Self::try_destroy)
    /// when that is an expected condition.
    pub fn destroy(&mut self, entity: Entity) {
        if let Err(err) = self.try_destroy(entity) {
            panic!("{err}");
        }
    }

    pub fn try_destroy(&mut self, entity: Entity) -> Result<(), EcsError> {
        let location = self
            .locations
            .remove(entity)
            .ok_or(EcsError::UnknownEntity { entity })?;
        let archetype = archetype_in_mut(&mut self.archetypes, location.archetype);
        let row = archetype.location_of(location.slot);

        // If an entity was compacted into the removed slot, update its location.
        if let Some(moved) = archetype.remove_row(&mut self.pool, row) {
            if let Some(moved_location) = self.locations.get_mut(moved) {
                moved_location.slot = location.slot;
            }
        }
        self.release_if_empty(location.archetype);
        Ok(())
    }

    #[inline]
    pub fn contains(&self, entity: Entity) -> bool {
        self.locations.contains(entity)
    }

    // -- structural mutation ------------------------------------------------

    /// Add component and tag types to an entity. Types it already has keep
    /// their values; new components are default-constructed.
    ///
    /// # Errors
    ///
    /// Fails, leaving the entity untouched, when the destination archetype
    /// cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if `entity` is not alive.
    pub fn add(&mut self, entity: Entity, sets: &ComponentAndTagSets) -> Result<(), EcsError> {
        let current = self.expect_location(entity, "add");
        let types = archetype_in(&self.archetypes, current.archetype).types().union(sets);
        self.migrate(entity, current, &types)
    }

    /// Remove component and tag types from an entity. Types it does not have
    /// are ignored; removed components are destroyed.
    ///
    /// # Panics
    ///
    /// Panics if `entity` is not alive.
    pub fn remove(&mut self, entity: Entity, sets: &ComponentAndTagSets) -> Result<(), EcsError> {
        let current = self.expect_location(entity, "remove");
        let types = archetype_in(&self.archetypes, current.archetype)
            .types()
            .difference(sets);
        self.migrate(entity, current, &types)
    }

    /// Typed [`add`](Self::add).
    pub fn add_types<L: TypeList>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let sets = L::register(&mut self.types)?;
        self.add(entity, &sets)
    }

    /// Typed [`remove`](Self::remove).
    pub fn remove_types<L: TypeList>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let sets = L::register(&mut self.types)?;
        self.remove(entity, &sets)
    }

    fn expect_location(&self, entity: Entity, operation: &str) -> EntityLocation {
        match self.locations.get(entity) {
            Some(location) => *location,
            None => panic!("{operation} on entity {entity}, which is not alive"),
        }
    }

    /// Move `entity` from its current archetype into the one for `types`.
    ///
    /// Components present on both sides are move-constructed into the new
    /// row; only newly added ones are default-constructed. The source row is
    /// then removed with the shared columns treated as already moved out.
    fn migrate(
        &mut self,
        entity: Entity,
        from: EntityLocation,
        types: &ComponentAndTagSets,
    ) -> Result<(), EcsError> {
        let source_types = *archetype_in(&self.archetypes, from.archetype).types();
        if source_types == *types {
            return Ok(());
        }
        let to = self.find_or_create_archetype(types)?;

        let shared = source_types.components.intersection(&types.components);
        // Safety: every `shared` column of the new row is move-constructed
        // below, before anything else touches the row.
        let dst_row = unsafe {
            archetype_in_mut(&mut self.archetypes, to).insert_row_for_move(
                &mut self.pool,
                entity,
                &shared,
            )
        };
        {
            let src = archetype_in(&self.archetypes, from.archetype);
            let dst = archetype_in(&self.archetypes, to);
            let src_row = src.location_of(from.slot);
            for index in shared.iter() {
                let component = ComponentType(index);
                let (Some(src_column), Some(dst_column)) = (
                    src.find_component_index(component),
                    dst.find_component_index(component),
                ) else {
                    unreachable!("{component:?} missing from an archetype that lists it");
                };
                let vtable = src.columns()[src_column].vtable();
                let src_ptr = src.component_ptr(&self.pool, src_row, src_column);
                let dst_ptr = dst.component_ptr(&self.pool, dst_row, dst_column);
                // Safety: the source slot is initialized and the destination
                // slot is not; the source counts as moved-out from here on.
                unsafe { (vtable.move_construct)(dst_ptr, src_ptr, 1) };
            }
            // Safety: both rows are occupied and belong to different archetypes.
            unsafe {
                *dst.tag_bits_ptr(&self.pool, dst_row) = *src.tag_bits_ptr(&self.pool, src_row);
            }
        }

        let src = archetype_in_mut(&mut self.archetypes, from.archetype);
        let src_row = src.location_of(from.slot);
        if let Some(moved) = src.remove_row_after_move(&mut self.pool, src_row, &shared) {
            if let Some(moved_location) = self.locations.get_mut(moved) {
                moved_location.slot = from.slot;
            }
        }

        let dst_slot = archetype_in(&self.archetypes, to).slot_of(dst_row);
        if let Some(location) = self.locations.get_mut(entity) {
            *location = EntityLocation {
                archetype: to,
                slot: dst_slot,
            };
        }
        trace!(
            entity = %entity,
            from = from.archetype.0,
            to = to.0,
            "migrated entity"
        );

        self.release_if_empty(from.archetype);
        Ok(())
    }

    // -- component access ---------------------------------------------------

    /// Pointer to `component` on `entity`, if both exist.
    fn component_ptr(&self, entity: Entity, component: ComponentType) -> Option<*mut u8> {
        let location = self.locations.get(entity)?;
        let archetype = archetype_in(&self.archetypes, location.archetype);
        let column = archetype.find_component_index(component)?;
        Some(archetype.component_ptr(&self.pool, archetype.location_of(location.slot), column))
    }

    /// Shared reference to `T` on `entity`, or `None` if the entity is not
    /// alive or lacks `T`.
    pub fn try_get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let component = self.types.component_of::<T>()?;
        let ptr = self.component_ptr(entity, component)?;
        // Safety: `component_of` only answers for a descriptor built from `T`
        // itself, so the column stores `T`; the reference borrows `self`.
        Some(unsafe { &*(ptr as *const T) })
    }

    pub fn try_get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let component = self.types.component_of::<T>()?;
        let ptr = self.component_ptr(entity, component)?;
        // Safety: as above, and `&mut self` makes the borrow exclusive.
        Some(unsafe { &mut *(ptr as *mut T) })
    }

    /// # Panics
    ///
    /// Panics if the entity is not alive or does not have `T`.
    pub fn get<T: Component>(&self, entity: Entity) -> &T {
        match self.try_get::<T>(entity) {
            Some(value) => value,
            None => panic!(
                "entity {entity} has no component {}",
                std::any::type_name::<T>()
            ),
        }
    }

    /// # Panics
    ///
    /// Panics if the entity is not alive or does not have `T`.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> &mut T {
        match self.try_get_mut::<T>(entity) {
            Some(value) => value,
            None => panic!(
                "entity {entity} has no component {}",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Several components of one entity at once, e.g.
    /// `try_get_many::<(&Position, &Velocity)>(e)`. `None` unless the entity
    /// is alive and has every requested component.
    ///
    /// # Panics
    ///
    /// Panics if the signature contains mutable items.
    pub fn try_get_many<Q: Query>(&self, entity: Entity) -> Option<Q::Refs<'_>> {
        assert!(
            !Q::HAS_MUTABLE,
            "EntityRegistry::try_get_many() cannot be used with mutable query items (&mut T). \
             Use EntityRegistry::try_get_many_mut() instead."
        );
        self.fetch_many::<Q>(entity)
    }

    /// Mutable variant of [`try_get_many`](Self::try_get_many).
    ///
    /// # Panics
    ///
    /// Panics if a component type appears twice with at least one mutable
    /// access.
    pub fn try_get_many_mut<Q: Query>(&mut self, entity: Entity) -> Option<Q::Refs<'_>> {
        validate_no_access_conflicts(&Q::access());
        self.fetch_many::<Q>(entity)
    }

    /// # Panics
    ///
    /// Panics if the entity is not alive, lacks one of the components, or
    /// the signature contains mutable items.
    pub fn get_many<Q: Query>(&self, entity: Entity) -> Q::Refs<'_> {
        match self.try_get_many::<Q>(entity) {
            Some(values) => values,
            None => panic!(
                "entity {entity} does not have all of {}",
                std::any::type_name::<Q>()
            ),
        }
    }

    /// # Panics
    ///
    /// Panics if the entity is not alive, lacks one of the components, or
    /// the signature aliases a component mutably.
    pub fn get_many_mut<Q: Query>(&mut self, entity: Entity) -> Q::Refs<'_> {
        match self.try_get_many_mut::<Q>(entity) {
            Some(values) => values,
            None => panic!(
                "entity {entity} does not have all of {}",
                std::any::type_name::<Q>()
            ),
        }
    }

    fn fetch_many<Q: Query>(&self, entity: Entity) -> Option<Q::Refs<'_>> {
        let components = Q::components(&self.types)?;
        let mut pointers = Vec::with_capacity(components.len());
        for component in components {
            pointers.push(self.component_ptr(entity, component)?);
        }
        // Safety: one pointer per item, each to a distinct initialized value
        // of the item's type; the callers enforce the aliasing rules.
        Some(unsafe { Q::values(&pointers) })
    }

    /// Raw, type-erased access for reflection layers.
    ///
    /// The pointer is valid until the next structural change of the registry.
    pub fn try_get_raw(&self, entity: Entity, component: ComponentType) -> Option<NonNull<u8>> {
        self.component_ptr(entity, component).and_then(NonNull::new)
    }

    /// Whether `entity` has the component or tag `T`.
    pub fn has<T: 'static>(&self, entity: Entity) -> bool {
        let Some(types) = self.type_sets(entity) else {
            return false;
        };
        match self.types.handle_of::<T>() {
            Some(TypeHandle::Component(c)) => types.has_component(c),
            Some(TypeHandle::Tag(t)) => types.has_tag(t),
            None => false,
        }
    }

    /// The entity's current component and tag sets.
    pub fn type_sets(&self, entity: Entity) -> Option<&ComponentAndTagSets> {
        let location = self.locations.get(entity)?;
        Some(archetype_in(&self.archetypes, location.archetype).types())
    }

    /// Per-entity flag word. Zero on creation, preserved by compaction and
    /// migration.
    pub fn tag_bits(&self, entity: Entity) -> Option<TagBits> {
        let location = self.locations.get(entity)?;
        let archetype = archetype_in(&self.archetypes, location.archetype);
        let ptr = archetype.tag_bits_ptr(&self.pool, archetype.location_of(location.slot));
        // Safety: occupied row.
        Some(unsafe { *ptr })
    }

    pub fn tag_bits_mut(&mut self, entity: Entity) -> Option<&mut TagBits> {
        let location = self.locations.get(entity)?;
        let archetype = archetype_in(&self.archetypes, location.archetype);
        let ptr = archetype.tag_bits_ptr(&self.pool, archetype.location_of(location.slot));
        // Safety: occupied row; `&mut self` makes the borrow exclusive.
        Some(unsafe { &mut *ptr })
    }

    // -- iteration ----------------------------------------------------------

    /// Build a shared per-chunk traversal over entities that have every
    /// component in `Q`.
    ///
    /// # Panics
    ///
    /// Panics if `Q` contains mutable items.
    pub fn range<Q: Query>(&self) -> Range<'_, Q> {
        assert!(
            !Q::HAS_MUTABLE,
            "EntityRegistry::range() cannot be used with mutable query items (&mut T). \
             Use EntityRegistry::range_mut() instead, which requires &mut self."
        );
        Range::new(self)
    }

    /// Build an exclusive per-chunk traversal.
    ///
    /// # Panics
    ///
    /// Panics if a component type appears twice in `Q` with at least one
    /// mutable access.
    pub fn range_mut<Q: Query>(&mut self) -> RangeMut<'_, Q> {
        validate_no_access_conflicts(&Q::access());
        RangeMut::new(self)
    }

    // -- bookkeeping --------------------------------------------------------

    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }

    /// Number of live archetypes.
    pub fn archetype_count(&self) -> usize {
        self.archetype_index.len()
    }

    /// Live entities in unspecified order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.locations.keys()
    }

    /// Dense index of an entity, suitable for per-entity side tables sized by
    /// [`max_entity_index`](Self::max_entity_index).
    pub fn extract_entity_index(&self, entity: Entity) -> u32 {
        entity.to_raw()
    }

    /// Upper bound (inclusive) of every index returned by
    /// [`extract_entity_index`](Self::extract_entity_index) so far.
    pub fn max_entity_index(&self) -> u32 {
        self.allocator.issued()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Free idle pooled chunks down to
    /// [`max_pooled_chunks`](StorageConfig::max_pooled_chunks), or all of
    /// them when no bound is configured. Returns the number freed.
    pub fn trim_pool(&mut self) -> usize {
        let keep = self.config.max_pooled_chunks.unwrap_or(0);
        self.pool.shrink_to(keep as usize)
    }
}

impl Drop for EntityRegistry {
    fn drop(&mut self) {
        for archetype in self.archetypes.iter_mut().flatten() {
            archetype.release_chunks(&mut self.pool);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
