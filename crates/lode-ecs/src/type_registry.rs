//! Component and tag type registration.
//!
//! Every type stored in an [`EntityRegistry`](crate::registry::EntityRegistry)
//! must first be described to a [`TypeRegistry`]. A component descriptor
//! carries the size, alignment and a [`ComponentVtable`] with the four
//! type-erased lifecycle operations; a tag descriptor only carries identity.
//! Registration hands out small integer handles ([`ComponentType`],
//! [`TagType`]) that index descriptor tables and [`TypeSet`](crate::type_set::TypeSet)
//! bits.
//!
//! Descriptors are immutable once registered and live as long as the
//! registry. There is no removal.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::ptr;

use tracing::debug;

use crate::type_set::MAX_COMPONENT_TYPES;
use crate::EcsError;

// ---------------------------------------------------------------------------
// StableTypeId
// ---------------------------------------------------------------------------

/// A type identifier that is stable across builds and processes.
///
/// Derived from a type name with `blake3`, so externally described types (for
/// example from a reflection layer) and Rust types registered through
/// [`Component`] share one id space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StableTypeId(u64);

impl StableTypeId {
    /// Hash a fully qualified type name into an identifier.
    pub fn from_name(name: &str) -> Self {
        let hash = blake3::hash(name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_le_bytes(bytes))
    }

    /// Identifier of a Rust type, derived from [`std::any::type_name`].
    ///
    /// `type_name` is only stable for a given compiler, which is enough for
    /// in-process identity.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::from_name(std::any::type_name::<T>())
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for StableTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StableTypeId({:#018x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle of a registered component type. Starts at 1; usable as an index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentType(pub(crate) u32);

/// Handle of a registered tag type. Starts at 1; usable as an index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagType(pub(crate) u32);

impl ComponentType {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl TagType {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentType({})", self.0)
    }
}

impl fmt::Debug for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagType({})", self.0)
    }
}

/// Whether a type is stored (component) or only marks membership (tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Component,
    Tag,
}

/// Result of resolving a [`StableTypeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeHandle {
    Component(ComponentType),
    Tag(TagType),
}

impl TypeHandle {
    pub fn kind(self) -> TypeKind {
        match self {
            TypeHandle::Component(_) => TypeKind::Component,
            TypeHandle::Tag(_) => TypeKind::Tag,
        }
    }
}

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A Rust type that can be attached to entities.
///
/// Stored components only need `Default` (used when a row is created or a
/// component is added without a value). Zero-sized markers opt into tag
/// semantics by overriding [`KIND`](Component::KIND):
///
/// ```
/// use lode_ecs::prelude::*;
///
/// #[derive(Default)]
/// struct Hidden;
///
/// impl Component for Hidden {
///     const KIND: TypeKind = TypeKind::Tag;
/// }
/// ```
pub trait Component: Default + Send + 'static {
    const KIND: TypeKind = TypeKind::Component;
}

// ---------------------------------------------------------------------------
// ComponentVtable
// ---------------------------------------------------------------------------

/// Type-erased lifecycle operations of a component type.
///
/// Every operation works on `count` contiguous, properly aligned values.
/// "Move" follows Rust semantics: after a move the source slots are logically
/// uninitialized and must not be destroyed again.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    /// Default-construct `count` values into uninitialized memory.
    pub(crate) create: unsafe fn(dst: *mut u8, count: usize),
    /// Drop `count` initialized values in place.
    pub(crate) destroy: unsafe fn(ptr: *mut u8, count: usize),
    /// Move `count` values from `src` into uninitialized `dst`.
    pub(crate) move_construct: unsafe fn(dst: *mut u8, src: *mut u8, count: usize),
    /// Drop the `count` values in `dst`, then move `src` into it.
    pub(crate) move_assign: unsafe fn(dst: *mut u8, src: *mut u8, count: usize),
}

impl ComponentVtable {
    /// Assemble a vtable from externally provided operations, for types that
    /// are only known through a reflection layer.
    ///
    /// # Safety
    ///
    /// The operations must implement the contracts documented on this type
    /// for a `Send` type whose size and alignment match the descriptor the
    /// vtable is registered with.
    pub unsafe fn from_raw(
        create: unsafe fn(*mut u8, usize),
        destroy: unsafe fn(*mut u8, usize),
        move_construct: unsafe fn(*mut u8, *mut u8, usize),
        move_assign: unsafe fn(*mut u8, *mut u8, usize),
    ) -> Self {
        Self {
            create,
            destroy,
            move_construct,
            move_assign,
        }
    }

    /// Build the vtable for a concrete type.
    pub fn of<T: Default + Send + 'static>() -> Self {
        unsafe fn create_impl<T: Default>(dst: *mut u8, count: usize) {
            let dst = dst as *mut T;
            for i in 0..count {
                ptr::write(dst.add(i), T::default());
            }
        }

        unsafe fn destroy_impl<T>(ptr: *mut u8, count: usize) {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr as *mut T, count));
        }

        unsafe fn move_construct_impl<T>(dst: *mut u8, src: *mut u8, count: usize) {
            ptr::copy_nonoverlapping(src as *const T, dst as *mut T, count);
        }

        unsafe fn move_assign_impl<T>(dst: *mut u8, src: *mut u8, count: usize) {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(dst as *mut T, count));
            ptr::copy_nonoverlapping(src as *const T, dst as *mut T, count);
        }

        Self {
            create: create_impl::<T>,
            destroy: destroy_impl::<T>,
            move_construct: move_construct_impl::<T>,
            move_assign: move_assign_impl::<T>,
        }
    }
}

impl fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentVtable").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Everything the storage engine needs to know about a component type.
///
/// Descriptors built with [`of`](Self::of) remember the Rust type they were
/// made from; typed access only ever reinterprets a column as that exact
/// type. Descriptors from [`from_raw`](Self::from_raw) are reachable by
/// handle only.
#[derive(Debug, Clone)]
pub struct ComponentTypeDesc {
    pub(crate) type_id: StableTypeId,
    pub(crate) name: String,
    pub(crate) size: u32,
    pub(crate) alignment: u32,
    pub(crate) vtable: ComponentVtable,
    pub(crate) rust_type: Option<TypeId>,
}

impl ComponentTypeDesc {
    /// Describe a Rust type.
    pub fn of<T: Default + Send + 'static>() -> Self {
        Self {
            type_id: StableTypeId::of::<T>(),
            name: std::any::type_name::<T>().to_owned(),
            size: std::mem::size_of::<T>() as u32,
            alignment: std::mem::align_of::<T>() as u32,
            vtable: ComponentVtable::of::<T>(),
            rust_type: Some(TypeId::of::<T>()),
        }
    }

    /// Describe a type known only through a reflection layer.
    ///
    /// # Safety
    ///
    /// `size` and `alignment` must be those of the type `vtable` operates on.
    pub unsafe fn from_raw(
        type_id: StableTypeId,
        name: impl Into<String>,
        size: u32,
        alignment: u32,
        vtable: ComponentVtable,
    ) -> Self {
        Self {
            type_id,
            name: name.into(),
            size,
            alignment,
            vtable,
            rust_type: None,
        }
    }

    pub fn type_id(&self) -> StableTypeId {
        self.type_id
    }

    /// Human-readable name, used in diagnostics only.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn vtable(&self) -> ComponentVtable {
        self.vtable
    }

    /// The Rust type this descriptor was built from, if any.
    pub fn rust_type(&self) -> Option<TypeId> {
        self.rust_type
    }
}

/// Identity of a tag type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTypeDesc {
    pub type_id: StableTypeId,
    pub name: String,
}

impl TagTypeDesc {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: StableTypeId::of::<T>(),
            name: std::any::type_name::<T>().to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// Maps stable type identifiers to component and tag descriptors.
///
/// Registration is idempotent: registering an already known identifier
/// returns the existing handle, provided size and alignment agree.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    /// Indexed by `ComponentType.0 - 1`.
    components: Vec<ComponentTypeDesc>,
    /// Indexed by `TagType.0 - 1`.
    tags: Vec<TagTypeDesc>,
    by_id: HashMap<StableTypeId, TypeHandle>,
    /// Fast path for typed lookups, filled by [`register`](Self::register).
    by_rust_type: HashMap<TypeId, TypeHandle>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component descriptor.
    ///
    /// # Errors
    ///
    /// - [`EcsError::DescriptorMismatch`] if the id is known with a different
    ///   size or alignment.
    /// - [`EcsError::StableIdCollision`] if the id is known for a different
    ///   Rust type.
    /// - [`EcsError::KindMismatch`] if the id is registered as a tag.
    /// - [`EcsError::TooManyTypes`] when the handle space is exhausted.
    pub fn register_component(
        &mut self,
        desc: ComponentTypeDesc,
    ) -> Result<ComponentType, EcsError> {
        match self.by_id.get(&desc.type_id) {
            Some(TypeHandle::Component(existing)) => {
                let known = &self.components[existing.0 as usize - 1];
                if let (Some(a), Some(b)) = (known.rust_type, desc.rust_type) {
                    if a != b {
                        return Err(EcsError::StableIdCollision {
                            name: desc.name,
                            existing: known.name.clone(),
                        });
                    }
                }
                if known.size != desc.size || known.alignment != desc.alignment {
                    return Err(EcsError::DescriptorMismatch {
                        name: desc.name,
                        size: desc.size,
                        alignment: desc.alignment,
                        existing_size: known.size,
                        existing_alignment: known.alignment,
                    });
                }
                return Ok(*existing);
            }
            Some(TypeHandle::Tag(_)) => {
                return Err(EcsError::KindMismatch {
                    name: desc.name,
                    existing: TypeKind::Tag,
                });
            }
            None => {}
        }

        if self.components.len() as u32 >= MAX_COMPONENT_TYPES {
            return Err(EcsError::TooManyTypes {
                name: desc.name,
                kind: TypeKind::Component,
                max: MAX_COMPONENT_TYPES,
            });
        }

        let handle = ComponentType(self.components.len() as u32 + 1);
        debug!(
            component = ?handle,
            name = %desc.name,
            size = desc.size,
            alignment = desc.alignment,
            "registered component type"
        );
        self.by_id
            .insert(desc.type_id, TypeHandle::Component(handle));
        self.components.push(desc);
        Ok(handle)
    }

    /// Register a tag descriptor. Same idempotence and error rules as
    /// [`register_component`](Self::register_component).
    pub fn register_tag(&mut self, desc: TagTypeDesc) -> Result<TagType, EcsError> {
        match self.by_id.get(&desc.type_id) {
            Some(TypeHandle::Tag(existing)) => return Ok(*existing),
            Some(TypeHandle::Component(_)) => {
                return Err(EcsError::KindMismatch {
                    name: desc.name,
                    existing: TypeKind::Component,
                });
            }
            None => {}
        }

        if self.tags.len() as u32 >= MAX_COMPONENT_TYPES {
            return Err(EcsError::TooManyTypes {
                name: desc.name,
                kind: TypeKind::Tag,
                max: MAX_COMPONENT_TYPES,
            });
        }

        let handle = TagType(self.tags.len() as u32 + 1);
        debug!(tag = ?handle, name = %desc.name, "registered tag type");
        self.by_id.insert(desc.type_id, TypeHandle::Tag(handle));
        self.tags.push(desc);
        Ok(handle)
    }

    /// Register a Rust type as a component or tag depending on
    /// [`Component::KIND`].
    ///
    /// # Errors
    ///
    /// [`EcsError::TagNotZeroSized`] for a tag with storage, plus the errors
    /// of [`register_component`](Self::register_component).
    pub fn register<T: Component>(&mut self) -> Result<TypeHandle, EcsError> {
        if let Some(&handle) = self.by_rust_type.get(&TypeId::of::<T>()) {
            return Ok(handle);
        }
        let handle = match T::KIND {
            TypeKind::Component => {
                TypeHandle::Component(self.register_component(ComponentTypeDesc::of::<T>())?)
            }
            TypeKind::Tag => {
                let size = std::mem::size_of::<T>();
                if size != 0 {
                    return Err(EcsError::TagNotZeroSized {
                        name: std::any::type_name::<T>().to_owned(),
                        size,
                    });
                }
                TypeHandle::Tag(self.register_tag(TagTypeDesc::of::<T>())?)
            }
        };
        self.by_rust_type.insert(TypeId::of::<T>(), handle);
        Ok(handle)
    }

    /// Resolve a stable identifier to its handle.
    pub fn resolve(&self, type_id: StableTypeId) -> Option<TypeHandle> {
        self.by_id.get(&type_id).copied()
    }

    pub fn find_component(&self, type_id: StableTypeId) -> Option<ComponentType> {
        match self.resolve(type_id)? {
            TypeHandle::Component(c) => Some(c),
            TypeHandle::Tag(_) => None,
        }
    }

    pub fn find_tag(&self, type_id: StableTypeId) -> Option<TagType> {
        match self.resolve(type_id)? {
            TypeHandle::Tag(t) => Some(t),
            TypeHandle::Component(_) => None,
        }
    }

    /// Handle of a Rust type, whether it was registered through
    /// [`register`](Self::register) or by descriptor.
    pub fn handle_of<T: 'static>(&self) -> Option<TypeHandle> {
        match self.by_rust_type.get(&TypeId::of::<T>()) {
            Some(&handle) => Some(handle),
            None => self.resolve(StableTypeId::of::<T>()),
        }
    }

    /// Component handle of `T`. `None` when `T` is unknown, is a tag, or the
    /// registered descriptor was not built from `T` itself.
    ///
    /// Every typed column access goes through this check.
    pub fn component_of<T: 'static>(&self) -> Option<ComponentType> {
        match self.handle_of::<T>()? {
            TypeHandle::Component(c) => {
                let desc = self.component_desc(c)?;
                (desc.rust_type == Some(TypeId::of::<T>())).then_some(c)
            }
            TypeHandle::Tag(_) => None,
        }
    }

    pub fn tag_of<T: 'static>(&self) -> Option<TagType> {
        match self.handle_of::<T>()? {
            TypeHandle::Tag(t) => Some(t),
            TypeHandle::Component(_) => None,
        }
    }

    pub fn component_desc(&self, component: ComponentType) -> Option<&ComponentTypeDesc> {
        (component.0 as usize)
            .checked_sub(1)
            .and_then(|i| self.components.get(i))
    }

    pub fn tag_desc(&self, tag: TagType) -> Option<&TagTypeDesc> {
        (tag.0 as usize).checked_sub(1).and_then(|i| self.tags.get(i))
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    impl Component for Pos {}

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Vel {
        dx: f64,
    }

    impl Component for Vel {}

    #[derive(Default)]
    struct Hidden;

    impl Component for Hidden {
        const KIND: TypeKind = TypeKind::Tag;
    }

    #[derive(Default)]
    struct FatTag(#[allow(dead_code)] u32);

    impl Component for FatTag {
        const KIND: TypeKind = TypeKind::Tag;
    }

    #[test]
    fn register_and_resolve() {
        let mut reg = TypeRegistry::new();
        let pos = reg.register_component(ComponentTypeDesc::of::<Pos>()).unwrap();
        assert_eq!(pos.index(), 1);
        assert_eq!(
            reg.resolve(StableTypeId::of::<Pos>()),
            Some(TypeHandle::Component(pos))
        );
        assert_eq!(reg.component_of::<Pos>(), Some(pos));
        assert_eq!(reg.component_desc(pos).unwrap().size(), 8);
    }

    #[test]
    fn registration_is_idempotent() {
        let mut reg = TypeRegistry::new();
        let a = reg.register_component(ComponentTypeDesc::of::<Pos>()).unwrap();
        let b = reg.register_component(ComponentTypeDesc::of::<Pos>()).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.component_count(), 1);
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let mut reg = TypeRegistry::new();
        reg.register_component(ComponentTypeDesc::of::<Pos>()).unwrap();
        let mut bogus = ComponentTypeDesc::of::<Pos>();
        bogus.size = 16;
        assert!(matches!(
            reg.register_component(bogus),
            Err(EcsError::DescriptorMismatch { .. })
        ));
    }

    #[test]
    fn handles_follow_registration_order() {
        let mut reg = TypeRegistry::new();
        let pos = reg.register::<Pos>().unwrap();
        let vel = reg.register::<Vel>().unwrap();
        let hidden = reg.register::<Hidden>().unwrap();
        assert_eq!(pos, TypeHandle::Component(ComponentType(1)));
        assert_eq!(vel, TypeHandle::Component(ComponentType(2)));
        assert_eq!(hidden, TypeHandle::Tag(TagType(1)));
        assert_eq!(reg.tag_of::<Hidden>(), Some(TagType(1)));
        assert_eq!(reg.component_of::<Hidden>(), None);
    }

    #[test]
    fn tags_must_be_zero_sized() {
        let mut reg = TypeRegistry::new();
        assert!(matches!(
            reg.register::<FatTag>(),
            Err(EcsError::TagNotZeroSized { size: 4, .. })
        ));
    }

    #[test]
    fn kind_conflicts_are_rejected() {
        let mut reg = TypeRegistry::new();
        reg.register_tag(TagTypeDesc::of::<Pos>()).unwrap();
        assert!(matches!(
            reg.register_component(ComponentTypeDesc::of::<Pos>()),
            Err(EcsError::KindMismatch { existing: TypeKind::Tag, .. })
        ));
    }

    #[test]
    fn handle_space_is_bounded() {
        let mut reg = TypeRegistry::new();
        for i in 0..MAX_COMPONENT_TYPES {
            let mut desc = ComponentTypeDesc::of::<Pos>();
            desc.type_id = StableTypeId::from_name(&format!("synthetic::{i}"));
            reg.register_component(desc).unwrap();
        }
        let mut desc = ComponentTypeDesc::of::<Pos>();
        desc.type_id = StableTypeId::from_name("synthetic::overflow");
        assert!(matches!(
            reg.register_component(desc),
            Err(EcsError::TooManyTypes { .. })
        ));
    }

    #[test]
    fn typed_lookup_requires_the_same_rust_type() {
        let mut reg = TypeRegistry::new();
        // Same stable id as `Pos`, different layout.
        let mut desc = ComponentTypeDesc::of::<Vel>();
        desc.type_id = StableTypeId::of::<Pos>();
        reg.register_component(desc).unwrap();
        assert_eq!(reg.component_of::<Pos>(), None);

        // Same stable id and same layout still does not alias.
        let mut reg = TypeRegistry::new();
        let mut desc = ComponentTypeDesc::of::<u64>();
        desc.type_id = StableTypeId::of::<Vel>();
        let handle = reg.register_component(desc).unwrap();
        assert_eq!(reg.handle_of::<Vel>(), Some(TypeHandle::Component(handle)));
        assert_eq!(reg.component_of::<Vel>(), None);
        assert_eq!(reg.component_of::<u64>(), None);
    }

    #[test]
    fn distinct_rust_types_cannot_share_an_id() {
        let mut reg = TypeRegistry::new();
        let mut desc = ComponentTypeDesc::of::<u64>();
        desc.type_id = StableTypeId::of::<Vel>();
        reg.register_component(desc).unwrap();
        assert!(matches!(
            reg.register::<Vel>(),
            Err(EcsError::StableIdCollision { .. })
        ));
    }

    #[test]
    fn raw_descriptors_are_reachable_by_handle_only() {
        let mut reg = TypeRegistry::new();
        let desc = unsafe {
            ComponentTypeDesc::from_raw(
                StableTypeId::of::<Vel>(),
                "script::Vel",
                8,
                8,
                ComponentVtable::of::<Vel>(),
            )
        };
        assert_eq!(desc.rust_type(), None);
        let handle = reg.register_component(desc).unwrap();
        assert_eq!(reg.component_desc(handle).unwrap().name(), "script::Vel");
        assert_eq!(reg.find_component(StableTypeId::of::<Vel>()), Some(handle));
        assert_eq!(reg.component_of::<Vel>(), None);
    }

    #[test]
    fn stable_ids_depend_only_on_name() {
        assert_eq!(
            StableTypeId::from_name("game::Position"),
            StableTypeId::from_name("game::Position")
        );
        assert_ne!(
            StableTypeId::from_name("game::Position"),
            StableTypeId::from_name("game::Velocity")
        );
    }

    #[test]
    fn vtable_moves_and_destroys() {
        use std::sync::Arc;

        let tracker = Arc::new(());
        let vt = ComponentVtable::of::<Option<Arc<()>>>();
        let mut src = std::mem::MaybeUninit::new(Some(Arc::clone(&tracker)));
        let mut dst = std::mem::MaybeUninit::<Option<Arc<()>>>::uninit();
        unsafe {
            (vt.move_construct)(dst.as_mut_ptr() as *mut u8, src.as_mut_ptr() as *mut u8, 1);
            assert_eq!(Arc::strong_count(&tracker), 2);
            (vt.create)(src.as_mut_ptr() as *mut u8, 1);
            assert!(src.assume_init_ref().is_none());
            (vt.move_assign)(dst.as_mut_ptr() as *mut u8, src.as_mut_ptr() as *mut u8, 1);
            assert_eq!(Arc::strong_count(&tracker), 1);
            (vt.destroy)(dst.as_mut_ptr() as *mut u8, 1);
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
