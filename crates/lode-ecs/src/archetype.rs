//! Archetype storage.
//!
//! An [`Archetype`] stores every entity that shares one exact
//! [`ComponentAndTagSets`]. Rows live in fixed-size chunks borrowed from the
//! [`ChunkPool`]; inside a chunk the layout is Structure-of-Arrays: one
//! contiguous array per component, then the entity-identifier array, then a
//! per-entity [`TagBits`] array.
//!
//! ```text
//! payload: [ C0 x n | C1 x n | ... | Entity x n | TagBits x n ]
//! ```
//!
//! Columns are ordered by decreasing alignment (ties broken by registration
//! order), which removes padding between component arrays. The layout is
//! computed once when the archetype is created and never changes.
//!
//! Rows are addressed by a *slot*: the archetype-wide row number, split into
//! `(chunk, offset)` by divmod against `entities_per_chunk`. Slots
//! `0..len()` are always occupied; removal moves the last row into the hole.
//!
//! # Safety
//!
//! Component values are manipulated through raw pointers and the descriptor
//! [`ComponentVtable`]. Every column keeps the vtable of its own component
//! type, and every row in `0..len()` holds initialized values for every
//! column. Those two facts are what the `unsafe` blocks below rely on.

use std::cmp::Reverse;
use std::mem::{align_of, size_of};
use std::ptr;

use crate::chunk_pool::{ChunkHandle, ChunkPool, CHUNK_ALIGNMENT, CHUNK_PAYLOAD_SIZE};
use crate::entity::Entity;
use crate::type_registry::{ComponentType, ComponentVtable, TagType, TypeRegistry};
use crate::type_set::{ComponentAndTagSets, TypeSet};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifies an archetype within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Physical position of a row: chunk index within the archetype, and row
/// offset within the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub chunk: u32,
    pub offset: u32,
}

/// Per-entity flag word stored next to the entity id. Zeroed when a row is
/// created, carried along by compaction and migration.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TagBits(pub u64);

// ---------------------------------------------------------------------------
// ColumnLayout
// ---------------------------------------------------------------------------

/// Placement of one component column inside every chunk of an archetype.
#[derive(Debug, Clone, Copy)]
pub struct ColumnLayout {
    pub component: ComponentType,
    /// Byte offset of the column array from the start of the payload.
    pub offset: u32,
    pub size: u32,
    pub alignment: u32,
    vtable: ComponentVtable,
}

impl ColumnLayout {
    #[inline]
    pub fn vtable(&self) -> &ComponentVtable {
        &self.vtable
    }
}

/// Raw view of one chunk, returned by [`Archetype::fetch_chunk_data`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkData {
    pub entities: *const Entity,
    pub tags: *mut TagBits,
    /// Occupied rows in the chunk.
    pub len: usize,
}

#[inline]
fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Lay out `columns` for `n` rows per chunk. Returns
/// `(entities_offset, tags_offset, total_bytes)`.
fn layout_columns(columns: &mut [ColumnLayout], n: usize) -> (usize, usize, usize) {
    let mut cursor = 0usize;
    for column in columns.iter_mut() {
        cursor = align_up(cursor, column.alignment as usize);
        column.offset = cursor as u32;
        cursor += column.size as usize * n;
    }
    let entities = align_up(cursor, align_of::<Entity>());
    cursor = entities + size_of::<Entity>() * n;
    let tags = align_up(cursor, align_of::<TagBits>());
    cursor = tags + size_of::<TagBits>() * n;
    (entities, tags, cursor)
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    types: ComponentAndTagSets,
    /// Sorted by decreasing alignment, then by component handle.
    columns: Vec<ColumnLayout>,
    chunks: Vec<ChunkHandle>,
    entities_per_chunk: u32,
    num_entities: u32,
    entities_offset: u32,
    tags_offset: u32,
}

impl Archetype {
    /// Compute the chunk layout for `types`.
    ///
    /// # Errors
    ///
    /// - [`EcsError::UnknownType`] if a handle in `types` is not registered.
    /// - [`EcsError::UnsupportedAlignment`] if a component needs more than
    ///   [`CHUNK_ALIGNMENT`].
    /// - [`EcsError::RowTooLarge`] if not even one row fits in a chunk.
    pub fn new(
        id: ArchetypeId,
        registry: &TypeRegistry,
        types: &ComponentAndTagSets,
    ) -> Result<Self, EcsError> {
        let mut columns = Vec::with_capacity(types.components.len());
        for index in types.components.iter() {
            let component = ComponentType(index);
            let desc = registry
                .component_desc(component)
                .ok_or_else(|| EcsError::UnknownType {
                    name: format!("{component:?}"),
                })?;
            if desc.alignment as usize > CHUNK_ALIGNMENT {
                return Err(EcsError::UnsupportedAlignment {
                    name: desc.name.clone(),
                    alignment: desc.alignment,
                    max: CHUNK_ALIGNMENT,
                });
            }
            columns.push(ColumnLayout {
                component,
                offset: 0,
                size: desc.size,
                alignment: desc.alignment,
                vtable: desc.vtable,
            });
        }
        for index in types.tags.iter() {
            let tag = TagType(index);
            if registry.tag_desc(tag).is_none() {
                return Err(EcsError::UnknownType {
                    name: format!("{tag:?}"),
                });
            }
        }

        columns.sort_by_key(|c| (Reverse(c.alignment), c.component));

        let row_bytes = columns.iter().map(|c| c.size as usize).sum::<usize>()
            + size_of::<Entity>()
            + size_of::<TagBits>();
        let mut n = CHUNK_PAYLOAD_SIZE / row_bytes;
        let (entities_offset, tags_offset) = loop {
            if n == 0 {
                return Err(EcsError::RowTooLarge {
                    row_bytes,
                    payload: CHUNK_PAYLOAD_SIZE,
                });
            }
            let (entities, tags, total) = layout_columns(&mut columns, n);
            if total <= CHUNK_PAYLOAD_SIZE {
                break (entities, tags);
            }
            n -= 1;
        };

        Ok(Self {
            id,
            types: *types,
            columns,
            chunks: Vec::new(),
            entities_per_chunk: n as u32,
            num_entities: 0,
            entities_offset: entities_offset as u32,
            tags_offset: tags_offset as u32,
        })
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    #[inline]
    pub fn types(&self) -> &ComponentAndTagSets {
        &self.types
    }

    #[inline]
    pub fn columns(&self) -> &[ColumnLayout] {
        &self.columns
    }

    #[inline]
    pub fn entities_per_chunk(&self) -> u32 {
        self.entities_per_chunk
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_entities as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_entities == 0
    }

    /// Chunks owned by the archetype, including unused capacity.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks holding at least one row. Always a prefix of the chunk list.
    #[inline]
    pub fn used_chunk_count(&self) -> usize {
        self.num_entities.div_ceil(self.entities_per_chunk) as usize
    }

    /// Occupied rows in `chunk_index`, as recorded in the chunk header.
    pub fn chunk_len(&self, pool: &ChunkPool, chunk_index: usize) -> u32 {
        pool.header(self.chunks[chunk_index]).num_entities
    }

    #[inline]
    pub fn location_of(&self, slot: u32) -> RowLocation {
        RowLocation {
            chunk: slot / self.entities_per_chunk,
            offset: slot % self.entities_per_chunk,
        }
    }

    #[inline]
    pub fn slot_of(&self, location: RowLocation) -> u32 {
        location.chunk * self.entities_per_chunk + location.offset
    }

    /// Linear scan; archetypes are narrow and this is off the hot path.
    pub fn find_component_index(&self, component: ComponentType) -> Option<usize> {
        self.columns.iter().position(|c| c.component == component)
    }

    #[inline]
    pub fn has_component(&self, component: ComponentType) -> bool {
        self.types.has_component(component)
    }

    // -- raw addressing -----------------------------------------------------

    #[inline]
    fn column_ptr(&self, pool: &ChunkPool, chunk: ChunkHandle, column: usize, offset: u32) -> *mut u8 {
        let layout = &self.columns[column];
        // Safety: offset < entities_per_chunk keeps the address inside the payload.
        unsafe {
            pool.payload_ptr(chunk)
                .add(layout.offset as usize + offset as usize * layout.size as usize)
        }
    }

    #[inline]
    fn entities_ptr(&self, pool: &ChunkPool, chunk: ChunkHandle) -> *mut Entity {
        // Safety: entities_offset lies within the payload and is aligned for Entity.
        unsafe { pool.payload_ptr(chunk).add(self.entities_offset as usize) as *mut Entity }
    }

    #[inline]
    fn tags_ptr(&self, pool: &ChunkPool, chunk: ChunkHandle) -> *mut TagBits {
        // Safety: tags_offset lies within the payload and is aligned for TagBits.
        unsafe { pool.payload_ptr(chunk).add(self.tags_offset as usize) as *mut TagBits }
    }

    /// Pointer to the value of column `column` at `location`.
    ///
    /// The row must be occupied and `column` in range; the pointer is valid
    /// until the next structural change of this archetype.
    #[inline]
    pub fn component_ptr(&self, pool: &ChunkPool, location: RowLocation, column: usize) -> *mut u8 {
        debug_assert!(self.slot_of(location) < self.num_entities);
        self.column_ptr(pool, self.chunks[location.chunk as usize], column, location.offset)
    }

    /// Entity stored at `location`.
    pub fn entity_at(&self, pool: &ChunkPool, location: RowLocation) -> Entity {
        assert!(self.slot_of(location) < self.num_entities, "row is not occupied");
        let chunk = self.chunks[location.chunk as usize];
        // Safety: occupied rows have an initialized entity id.
        unsafe { *self.entities_ptr(pool, chunk).add(location.offset as usize) }
    }

    /// Pointer to the tag bits of the row at `location`.
    pub fn tag_bits_ptr(&self, pool: &ChunkPool, location: RowLocation) -> *mut TagBits {
        debug_assert!(self.slot_of(location) < self.num_entities);
        let chunk = self.chunks[location.chunk as usize];
        // Safety: offset < entities_per_chunk.
        unsafe { self.tags_ptr(pool, chunk).add(location.offset as usize) }
    }

    /// Column base pointers for `chunk_index`, written into `out` in the
    /// order of `columns`, plus the chunk's entity and tag arrays.
    ///
    /// Every index in `columns` must come from
    /// [`find_component_index`](Self::find_component_index) on this
    /// archetype.
    pub fn fetch_chunk_data(
        &self,
        pool: &ChunkPool,
        chunk_index: usize,
        columns: &[usize],
        out: &mut [*mut u8],
    ) -> ChunkData {
        debug_assert_eq!(columns.len(), out.len());
        let chunk = self.chunks[chunk_index];
        for (dst, &column) in out.iter_mut().zip(columns) {
            *dst = self.column_ptr(pool, chunk, column, 0);
        }
        ChunkData {
            entities: self.entities_ptr(pool, chunk),
            tags: self.tags_ptr(pool, chunk),
            len: pool.header(chunk).num_entities as usize,
        }
    }

    // -- structural operations ----------------------------------------------

    /// Grow the chunk list to at least `count` chunks.
    pub fn reserve_chunks(&mut self, pool: &mut ChunkPool, count: usize) {
        while self.chunks.len() < count {
            self.chunks.push(pool.acquire());
        }
    }

    /// Append a row for `entity` with default-constructed components.
    pub fn insert_row(&mut self, pool: &mut ChunkPool, entity: Entity) -> RowLocation {
        // Safety: nothing is left uninitialized.
        unsafe { self.insert_row_for_move(pool, entity, &TypeSet::EMPTY) }
    }

    /// Append a row for `entity`, default-constructing every component except
    /// those in `moved_in`, whose slots are left uninitialized.
    ///
    /// # Safety
    ///
    /// Before the row is read, removed or released, the caller must
    /// move-construct a value into each `moved_in` column of the returned
    /// location.
    pub(crate) unsafe fn insert_row_for_move(
        &mut self,
        pool: &mut ChunkPool,
        entity: Entity,
        moved_in: &TypeSet,
    ) -> RowLocation {
        let location = self.location_of(self.num_entities);
        self.reserve_chunks(pool, location.chunk as usize + 1);
        let chunk = self.chunks[location.chunk as usize];
        debug_assert_eq!(pool.header(chunk).num_entities, location.offset);

        for column in 0..self.columns.len() {
            if moved_in.contains(self.columns[column].component.index()) {
                continue;
            }
            let dst = self.column_ptr(pool, chunk, column, location.offset);
            // Safety: slot is past the occupied range, so dst is uninitialized.
            unsafe { (self.columns[column].vtable.create)(dst, 1) };
        }
        // Safety: offsets are within the chunk arrays.
        unsafe {
            ptr::write(self.entities_ptr(pool, chunk).add(location.offset as usize), entity);
            ptr::write(self.tags_ptr(pool, chunk).add(location.offset as usize), TagBits(0));
        }

        pool.header_mut(chunk).num_entities += 1;
        self.num_entities += 1;
        location
    }

    /// Remove the row at `location`, destroying its components and moving the
    /// last row into the hole.
    ///
    /// Returns the entity that now occupies `location`, or `None` if the
    /// removed row was the last one.
    pub fn remove_row(&mut self, pool: &mut ChunkPool, location: RowLocation) -> Option<Entity> {
        self.remove_row_after_move(pool, location, &TypeSet::EMPTY)
    }

    /// Like [`remove_row`](Self::remove_row), but components whose type is in
    /// `moved_out` have already been moved elsewhere: their slots are treated
    /// as uninitialized and are never destroyed.
    pub fn remove_row_after_move(
        &mut self,
        pool: &mut ChunkPool,
        location: RowLocation,
        moved_out: &TypeSet,
    ) -> Option<Entity> {
        let slot = self.slot_of(location);
        assert!(slot < self.num_entities, "removing an unoccupied row");

        let last = self.location_of(self.num_entities - 1);
        let dst_chunk = self.chunks[location.chunk as usize];
        let src_chunk = self.chunks[last.chunk as usize];

        let relocated = if slot != self.num_entities - 1 {
            for (column, layout) in self.columns.iter().enumerate() {
                let dst = self.column_ptr(pool, dst_chunk, column, location.offset);
                let src = self.column_ptr(pool, src_chunk, column, last.offset);
                // Safety: src is the initialized last row; dst is initialized
                // unless its value was moved out, in which case it is
                // constructed instead of assigned.
                unsafe {
                    if moved_out.contains(layout.component.index()) {
                        (layout.vtable.move_construct)(dst, src, 1);
                    } else {
                        (layout.vtable.move_assign)(dst, src, 1);
                    }
                }
            }
            // Safety: both offsets address occupied rows.
            unsafe {
                let moved = *self.entities_ptr(pool, src_chunk).add(last.offset as usize);
                *self.entities_ptr(pool, dst_chunk).add(location.offset as usize) = moved;
                *self.tags_ptr(pool, dst_chunk).add(location.offset as usize) =
                    *self.tags_ptr(pool, src_chunk).add(last.offset as usize);
                Some(moved)
            }
        } else {
            for (column, layout) in self.columns.iter().enumerate() {
                if moved_out.contains(layout.component.index()) {
                    continue;
                }
                let dst = self.column_ptr(pool, dst_chunk, column, location.offset);
                // Safety: occupied row, value not moved out.
                unsafe { (layout.vtable.destroy)(dst, 1) };
            }
            None
        };

        pool.header_mut(src_chunk).num_entities -= 1;
        self.num_entities -= 1;
        relocated
    }

    /// Destroy every remaining row and give all chunks back to the pool.
    pub fn release_chunks(&mut self, pool: &mut ChunkPool) {
        for chunk_index in 0..self.used_chunk_count() {
            let chunk = self.chunks[chunk_index];
            let len = pool.header(chunk).num_entities as usize;
            for (column, layout) in self.columns.iter().enumerate() {
                let base = self.column_ptr(pool, chunk, column, 0);
                // Safety: the first `len` rows of the chunk are initialized.
                unsafe { (layout.vtable.destroy)(base, len) };
            }
            pool.header_mut(chunk).num_entities = 0;
        }
        for chunk in self.chunks.drain(..) {
            pool.release(chunk);
        }
        self.num_entities = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
