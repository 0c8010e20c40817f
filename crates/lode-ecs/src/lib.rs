//! Lode ECS -- chunked archetype entity/component storage.
//!
//! Entities that share an exact set of component and tag types live together
//! in an archetype. Each archetype stores its rows in fixed-size 16 KiB chunks
//! drawn from a shared pool, laid out Structure-of-Arrays so that iteration
//! walks contiguous column slices. Entity identifiers are stable across
//! structural changes: a sparse index maps each entity to its current row,
//! and is fixed up whenever rows are compacted or migrated.
//!
//! # Quick Start
//!
//! ```
//! use lode_ecs::prelude::*;
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//! impl Component for Position {}
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//! impl Component for Velocity {}
//!
//! let mut registry = EntityRegistry::new(TypeRegistry::new());
//! let entity = registry.create_with::<(Position,)>(1).unwrap();
//! registry.get_mut::<Position>(entity).x = 4.0;
//!
//! registry.add_types::<(Velocity,)>(entity).unwrap();
//! assert_eq!(registry.get::<Position>(entity), &Position { x: 4.0, y: 0.0 });
//! assert!(registry.has::<Velocity>(entity));
//!
//! registry.destroy(entity);
//! assert!(!registry.contains(entity));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
#[allow(unsafe_code)]
pub mod chunk_pool;
pub mod config;
pub mod entity;
#[allow(unsafe_code)]
pub mod range;
#[allow(unsafe_code)]
pub mod registry;
#[allow(unsafe_code)]
pub mod type_registry;
pub mod type_set;

use type_registry::TypeKind;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by storage operations.
///
/// These are recoverable policy failures. Caller contract violations, such as
/// destroying an entity that is not alive, panic instead.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A handle was used that the type registry never issued.
    #[error("type {name} is not registered")]
    UnknownType { name: String },

    /// A stable id was re-registered with a different layout.
    #[error(
        "type '{name}' re-registered as {size} bytes / align {alignment}, \
         but is already known as {existing_size} bytes / align {existing_alignment}"
    )]
    DescriptorMismatch {
        name: String,
        size: u32,
        alignment: u32,
        existing_size: u32,
        existing_alignment: u32,
    },

    /// A stable id is already registered with the other kind.
    #[error("type '{name}' is already registered as a {existing:?}")]
    KindMismatch { name: String, existing: TypeKind },

    /// Two distinct Rust types map to the same stable id.
    #[error("type '{name}' collides with already registered '{existing}'")]
    StableIdCollision { name: String, existing: String },

    /// Tags carry no data.
    #[error("tag type '{name}' must be zero-sized, but is {size} bytes")]
    TagNotZeroSized { name: String, size: usize },

    /// The handle space for one kind of type is exhausted.
    #[error("cannot register '{name}': at most {max} {kind:?} types are supported")]
    TooManyTypes {
        name: String,
        kind: TypeKind,
        max: u32,
    },

    /// A single row does not fit into one chunk.
    #[error("row of {row_bytes} bytes does not fit into a {payload}-byte chunk")]
    RowTooLarge { row_bytes: usize, payload: usize },

    /// A component needs stricter alignment than chunks provide.
    #[error("component '{name}' needs alignment {alignment}, chunks provide {max}")]
    UnsupportedAlignment {
        name: String,
        alignment: u32,
        max: usize,
    },

    /// The entity was never created or has been destroyed.
    #[error("entity {entity} does not exist")]
    UnknownEntity { entity: entity::Entity },

    /// The 32-bit entity identifier space is used up.
    #[error("entity identifiers exhausted")]
    EntityIdsExhausted,

    /// A storage configuration could not be parsed.
    #[error("invalid storage config: {details}")]
    InvalidConfig { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, TagBits};
    pub use crate::chunk_pool::{ChunkPool, PoolStats};
    pub use crate::config::{EmptyArchetypePolicy, StorageConfig};
    pub use crate::entity::Entity;
    pub use crate::range::{Query, QueryItem, Range, RangeMut};
    pub use crate::registry::{EntityRegistry, TypeList};
    pub use crate::type_registry::{
        Component, ComponentType, ComponentTypeDesc, StableTypeId, TagType, TagTypeDesc,
        TypeHandle, TypeKind, TypeRegistry,
    };
    pub use crate::type_set::{ComponentAndTagSets, TypeSet};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
