//! Property-based tests for the entity registry.
//!
//! Random sequences of creates, destroys and structural changes are applied to
//! an [`EntityRegistry`] and to a plain `HashMap` model side by side. After
//! every operation the registry must agree with the model on liveness and
//! component values, and every archetype must keep its rows packed.

use std::collections::HashMap;

use lode_ecs::prelude::*;
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Test component types
// ---------------------------------------------------------------------------

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

/// Owns heap memory, so a bad move or a double drop corrupts the value.
#[derive(Debug, Default, Clone, PartialEq)]
struct Label(String);
impl Component for Label {}

#[derive(Default)]
struct Frozen;
impl Component for Frozen {
    const KIND: TypeKind = TypeKind::Tag;
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
struct Row {
    pos: Option<Pos>,
    vel: Option<Vel>,
    label: Option<Label>,
    frozen: bool,
}

// ---------------------------------------------------------------------------
// Operation strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    /// Create `count` entities with position and label.
    Create { count: u32, x: f32, y: f32 },
    /// Create a single entity with nothing but a velocity.
    CreateVel { dx: f32 },
    /// Destroy the entity at `index` (mod number of live entities).
    Destroy { index: usize },
    AddVel { index: usize, dx: f32, dy: f32 },
    RemoveVel { index: usize },
    RemovePos { index: usize },
    Freeze { index: usize },
    Thaw { index: usize },
    /// Add one to every velocity through a mutable range.
    BumpVelocities,
}

fn finite_f32() -> impl Strategy<Value = f32> {
    -1000.0f32..1000.0f32
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..40, finite_f32(), finite_f32())
            .prop_map(|(count, x, y)| Op::Create { count, x, y }),
        1 => finite_f32().prop_map(|dx| Op::CreateVel { dx }),
        3 => any::<usize>().prop_map(|index| Op::Destroy { index }),
        2 => (any::<usize>(), finite_f32(), finite_f32())
            .prop_map(|(index, dx, dy)| Op::AddVel { index, dx, dy }),
        2 => any::<usize>().prop_map(|index| Op::RemoveVel { index }),
        1 => any::<usize>().prop_map(|index| Op::RemovePos { index }),
        1 => any::<usize>().prop_map(|index| Op::Freeze { index }),
        1 => any::<usize>().prop_map(|index| Op::Thaw { index }),
        1 => Just(Op::BumpVelocities),
    ]
}

fn policy_strategy() -> impl Strategy<Value = EmptyArchetypePolicy> {
    prop_oneof![
        Just(EmptyArchetypePolicy::Retain),
        Just(EmptyArchetypePolicy::Teardown),
    ]
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn setup(policy: EmptyArchetypePolicy) -> EntityRegistry {
    let mut types = TypeRegistry::new();
    types.register::<Pos>().unwrap();
    types.register::<Vel>().unwrap();
    types.register::<Label>().unwrap();
    types.register::<Frozen>().unwrap();
    let config = StorageConfig {
        empty_archetype_policy: policy,
        ..StorageConfig::default()
    };
    EntityRegistry::with_config(types, config)
}

/// Sorted list of live entities in the model, so `index` picks are
/// deterministic for a given op sequence.
fn pick(model: &HashMap<Entity, Row>, index: usize) -> Option<Entity> {
    if model.is_empty() {
        return None;
    }
    let mut alive: Vec<Entity> = model.keys().copied().collect();
    alive.sort();
    Some(alive[index % alive.len()])
}

fn apply(registry: &mut EntityRegistry, model: &mut HashMap<Entity, Row>, op: &Op) {
    match *op {
        Op::Create { count, x, y } => {
            let first = registry.create_with::<(Pos, Label)>(count).unwrap();
            for i in 0..count {
                let e = first.offset(i);
                *registry.get_mut::<Pos>(e) = Pos { x, y };
                registry.get_mut::<Label>(e).0 = format!("entity-{}", e.to_raw());
                model.insert(
                    e,
                    Row {
                        pos: Some(Pos { x, y }),
                        label: Some(Label(format!("entity-{}", e.to_raw()))),
                        ..Row::default()
                    },
                );
            }
        }
        Op::CreateVel { dx } => {
            let e = registry.create_with::<(Vel,)>(1).unwrap();
            registry.get_mut::<Vel>(e).dx = dx;
            model.insert(
                e,
                Row {
                    vel: Some(Vel { dx, dy: 0.0 }),
                    ..Row::default()
                },
            );
        }
        Op::Destroy { index } => {
            if let Some(e) = pick(model, index) {
                registry.destroy(e);
                model.remove(&e);
            }
        }
        Op::AddVel { index, dx, dy } => {
            if let Some(e) = pick(model, index) {
                let row = model.get_mut(&e).unwrap();
                registry.add_types::<(Vel,)>(e).unwrap();
                if row.vel.is_none() {
                    // Newly added components start at their default.
                    assert_eq!(registry.get::<Vel>(e), &Vel::default());
                }
                *registry.get_mut::<Vel>(e) = Vel { dx, dy };
                row.vel = Some(Vel { dx, dy });
            }
        }
        Op::RemoveVel { index } => {
            if let Some(e) = pick(model, index) {
                registry.remove_types::<(Vel,)>(e).unwrap();
                model.get_mut(&e).unwrap().vel = None;
            }
        }
        Op::RemovePos { index } => {
            if let Some(e) = pick(model, index) {
                registry.remove_types::<(Pos,)>(e).unwrap();
                model.get_mut(&e).unwrap().pos = None;
            }
        }
        Op::Freeze { index } => {
            if let Some(e) = pick(model, index) {
                registry.add_types::<(Frozen,)>(e).unwrap();
                model.get_mut(&e).unwrap().frozen = true;
            }
        }
        Op::Thaw { index } => {
            if let Some(e) = pick(model, index) {
                registry.remove_types::<(Frozen,)>(e).unwrap();
                model.get_mut(&e).unwrap().frozen = false;
            }
        }
        Op::BumpVelocities => {
            for (_, (vels,)) in registry.range_mut::<(&mut Vel,)>() {
                for vel in vels.iter_mut() {
                    vel.dx += 1.0;
                }
            }
            for row in model.values_mut() {
                if let Some(vel) = row.vel.as_mut() {
                    vel.dx += 1.0;
                }
            }
        }
    }
}

fn check_invariants(
    registry: &EntityRegistry,
    model: &HashMap<Entity, Row>,
) -> Result<(), TestCaseError> {
    prop_assert_eq!(registry.entity_count(), model.len());

    for (&e, row) in model {
        prop_assert!(registry.contains(e));
        prop_assert_eq!(registry.try_get::<Pos>(e), row.pos.as_ref());
        prop_assert_eq!(registry.try_get::<Vel>(e), row.vel.as_ref());
        prop_assert_eq!(registry.try_get::<Label>(e), row.label.as_ref());
        prop_assert_eq!(registry.has::<Frozen>(e), row.frozen);
    }

    // Rows are packed: every used chunk but the last is full, and chunk
    // headers add up to the archetype's entity count.
    let mut total = 0usize;
    let mut owned_chunks = 0usize;
    for archetype in registry.archetypes() {
        let per_chunk = archetype.entities_per_chunk();
        let used = archetype.used_chunk_count();
        let mut rows = 0usize;
        for chunk in 0..archetype.chunk_count() {
            let len = archetype.chunk_len(registry.pool(), chunk);
            if chunk + 1 < used {
                prop_assert_eq!(len, per_chunk);
            } else if chunk >= used {
                prop_assert_eq!(len, 0);
            }
            rows += len as usize;
        }
        prop_assert_eq!(rows, archetype.len());
        total += rows;
        owned_chunks += archetype.chunk_count();
    }
    prop_assert_eq!(total, model.len());
    prop_assert_eq!(registry.pool_stats().in_use, owned_chunks);

    // Range traversal sees exactly the live entities that have a Vel.
    let with_vel = model.values().filter(|row| row.vel.is_some()).count();
    prop_assert_eq!(registry.range::<(&Vel,)>().count_rows(), with_vel);
    let frozen_pos = model
        .values()
        .filter(|row| row.frozen && row.pos.is_some())
        .count();
    prop_assert_eq!(
        registry.range::<(&Pos,)>().with::<Frozen>().count_rows(),
        frozen_pos
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn registry_matches_model(
        policy in policy_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let mut registry = setup(policy);
        let mut model = HashMap::new();
        for op in &ops {
            apply(&mut registry, &mut model, op);
            check_invariants(&registry, &model)?;
        }
    }

    #[test]
    fn entity_ids_are_never_reused(
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let mut registry = setup(EmptyArchetypePolicy::Teardown);
        let mut model = HashMap::new();
        let mut high_water = 0u32;
        for op in &ops {
            apply(&mut registry, &mut model, op);
            prop_assert!(registry.max_entity_index() >= high_water);
            high_water = registry.max_entity_index();
            for e in model.keys() {
                prop_assert!(e.to_raw() <= high_water);
            }
        }
    }

    #[test]
    fn teardown_leaves_no_empty_archetypes(
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let mut registry = setup(EmptyArchetypePolicy::Teardown);
        let mut model = HashMap::new();
        for op in &ops {
            apply(&mut registry, &mut model, op);
            prop_assert!(registry.archetypes().all(|a| !a.is_empty()));
        }
    }
}
