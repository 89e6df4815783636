//! trecs -- an archetype-graph Entity-Component-System registry.
//!
//! Entities are grouped into archetypes (one per unique set of component
//! types) stored in a Structure-of-Arrays layout for cache-friendly
//! iteration. Archetypes are connected by a lazily-built graph of `plus`/
//! `minus` edges keyed by component type, so adding or removing a component
//! walks (or materialises) a single edge rather than rehashing a type set.
//! Generational entity ids give immediate stale-reference detection.
//!
//! # Quick Start
//!
//! ```
//! use trecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut registry = Registry::new();
//! let e = registry.create();
//! registry.add(e, Position { x: 0.0, y: 0.0 }).unwrap();
//! registry.add(e, Velocity { dx: 1.0, dy: 0.0 }).unwrap();
//!
//! for (_entity, (pos, vel)) in registry.view_mut::<(&mut Position, &Velocity)>() {
//!     pos.x += vel.dx;
//!     pos.y += vel.dy;
//! }
//!
//! assert_eq!(registry.get::<Position>(e), Ok(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
pub mod component;
pub mod entity;
pub mod registry;
#[allow(unsafe_code)]
pub mod view;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by registry operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist: never allocated, already destroyed, or a
    /// stale handle whose generation no longer matches its recycled slot.
    #[error("entity {0:?} does not exist (destroyed, stale, or never allocated)")]
    InvalidEntity(entity::EntityId),

    /// The entity already carries this component type.
    #[error("entity {entity:?} already has component '{component}'")]
    AlreadyHas {
        entity: entity::EntityId,
        component: &'static str,
    },

    /// The entity does not carry this component type.
    #[error("entity {entity:?} has no component '{component}'")]
    MissingComponent {
        entity: entity::EntityId,
        component: &'static str,
    },

    /// A row index fell outside an archetype's current length.
    #[error("row {row} is out of bounds for archetype of length {len}")]
    OutOfBounds { row: usize, len: usize },

    /// An archetype graph edge was expected but has not been materialised.
    #[error("archetype graph edge not materialised")]
    MissingEdge,

    /// The component-type registrar has reached its 64-type capacity.
    #[error("component registrar is at its 64-type capacity")]
    CapacityExceeded,
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::component::{ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::entity::EntityId;
    pub use crate::registry::{ComponentSet, GetTuple, RemovableSet, Registry};
    pub use crate::view::View;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    fn setup_registry() -> Registry {
        Registry::new()
    }

    #[test]
    fn spawn_entities_with_components_and_view_back() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 1.0, y: 2.0 }).unwrap();
        reg.add(e, Velocity { dx: 3.0, dy: 4.0 }).unwrap();

        assert_eq!(reg.get::<Position>(e), Ok(&Position { x: 1.0, y: 2.0 }));
        assert_eq!(reg.get::<Velocity>(e), Ok(&Velocity { dx: 3.0, dy: 4.0 }));
    }

    #[test]
    fn destroy_entity_verify_gone() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 0.0, y: 0.0 }).unwrap();
        reg.destroy(e).unwrap();
        assert!(!reg.is_alive(e));
        assert!(matches!(reg.get::<Position>(e), Err(EcsError::InvalidEntity(_))));
        assert_eq!(reg.alive_count(), 0);
    }

    #[test]
    fn add_component_triggers_migration() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 1.0, y: 2.0 }).unwrap();
        let arch_count_before = reg.archetype_count();

        reg.add(e, Velocity { dx: 5.0, dy: 6.0 }).unwrap();

        assert!(reg.has::<(Velocity,)>(e).unwrap());
        assert_eq!(reg.get::<Position>(e), Ok(&Position { x: 1.0, y: 2.0 }));
        assert!(reg.archetype_count() > arch_count_before);
    }

    #[test]
    fn remove_component_triggers_migration() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 1.0, y: 2.0 }).unwrap();
        reg.add(e, Velocity { dx: 3.0, dy: 4.0 }).unwrap();

        reg.remove::<Velocity>(e).unwrap();

        assert!(!reg.has::<(Velocity,)>(e).unwrap());
        assert_eq!(reg.get::<Position>(e), Ok(&Position { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn get_set_components() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 0.0, y: 0.0 }).unwrap();
        if let Ok(pos) = reg.get_mut::<Position>(e) {
            pos.x = 42.0;
            pos.y = 99.0;
        }
        assert_eq!(reg.get::<Position>(e), Ok(&Position { x: 42.0, y: 99.0 }));
    }

    #[test]
    fn view_matching_entities_only() {
        let mut reg = setup_registry();

        let e1 = reg.create();
        reg.add(e1, Position { x: 1.0, y: 2.0 }).unwrap();
        reg.add(e1, Velocity { dx: 3.0, dy: 4.0 }).unwrap();

        let e2 = reg.create();
        reg.add(e2, Position { x: 10.0, y: 20.0 }).unwrap();

        let results: Vec<_> = reg.view::<(&Position, &Velocity)>().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, e1);
    }

    #[test]
    fn view_skips_entities_missing_required() {
        let mut reg = setup_registry();
        for i in 0..5 {
            let e = reg.create();
            reg.add(e, Position { x: i as f32, y: 0.0 }).unwrap();
        }
        let results: Vec<_> = reg.view::<(&Position, &Velocity)>().collect();
        assert_eq!(results.len(), 0);
    }

    #[test]
    fn mutable_view_modifies_components() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 0.0, y: 0.0 }).unwrap();
        reg.add(e, Velocity { dx: 1.0, dy: 2.0 }).unwrap();

        for (_entity, (pos, vel)) in reg.view_mut::<(&mut Position, &Velocity)>() {
            pos.x += vel.dx;
            pos.y += vel.dy;
        }

        assert_eq!(reg.get::<Position>(e), Ok(&Position { x: 1.0, y: 2.0 }));
    }

    // -- scale test -----------------------------------------------------------

    #[test]
    fn scale_10k_entities() {
        let mut reg = setup_registry();

        let mut entities = Vec::with_capacity(10_000);
        for i in 0..10_000u32 {
            let e = reg.create();
            reg.add(
                e,
                Position {
                    x: i as f32,
                    y: i as f32 * 2.0,
                },
            )
            .unwrap();
            reg.add(e, Velocity { dx: 1.0, dy: -1.0 }).unwrap();
            entities.push(e);
        }

        let count = reg.view::<(&Position, &Velocity)>().count();
        assert_eq!(count, 10_000);

        for (_entity, (vel,)) in reg.view_mut::<(&mut Velocity,)>() {
            vel.dx *= 2.0;
            vel.dy *= 2.0;
        }

        let vel = reg.get::<Velocity>(entities[0]).unwrap();
        assert_eq!(vel.dx, 2.0);
        assert_eq!(vel.dy, -2.0);

        for e in entities.iter().take(5_000) {
            reg.destroy(*e).unwrap();
        }

        let count = reg.view::<(&Position, &Velocity)>().count();
        assert_eq!(count, 5_000);
        assert_eq!(reg.alive_count(), 5_000);
    }

    // -- stale entity tests ----------------------------------------------------

    #[test]
    fn stale_entity_destroy_returns_error() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 0.0, y: 0.0 }).unwrap();
        reg.destroy(e).unwrap();
        assert!(reg.destroy(e).is_err());
    }

    #[test]
    fn add_on_stale_entity_returns_error() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 0.0, y: 0.0 }).unwrap();
        reg.destroy(e).unwrap();
        let result = reg.add(e, Velocity { dx: 1.0, dy: 1.0 });
        assert!(result.is_err());
    }

    // -- multiple entities in same archetype -------------------------------------

    #[test]
    fn multiple_entities_same_archetype() {
        let mut reg = setup_registry();
        let e1 = reg.create();
        reg.add(e1, Position { x: 1.0, y: 1.0 }).unwrap();
        let e2 = reg.create();
        reg.add(e2, Position { x: 2.0, y: 2.0 }).unwrap();
        let e3 = reg.create();
        reg.add(e3, Position { x: 3.0, y: 3.0 }).unwrap();

        assert_eq!(reg.get::<Position>(e1), Ok(&Position { x: 1.0, y: 1.0 }));
        assert_eq!(reg.get::<Position>(e2), Ok(&Position { x: 2.0, y: 2.0 }));
        assert_eq!(reg.get::<Position>(e3), Ok(&Position { x: 3.0, y: 3.0 }));

        reg.destroy(e2).unwrap();
        assert_eq!(reg.alive_count(), 2);
        assert_eq!(reg.get::<Position>(e1), Ok(&Position { x: 1.0, y: 1.0 }));
        assert_eq!(reg.get::<Position>(e3), Ok(&Position { x: 3.0, y: 3.0 }));
    }

    #[test]
    fn update_overwrites_in_place_without_migration() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Position { x: 1.0, y: 2.0 }).unwrap();
        let arch_count_before = reg.archetype_count();

        reg.update(e, Position { x: 99.0, y: 100.0 }).unwrap();

        assert_eq!(reg.get::<Position>(e), Ok(&Position { x: 99.0, y: 100.0 }));
        assert_eq!(reg.archetype_count(), arch_count_before);
    }

    #[test]
    fn health_component_independent_of_position_velocity() {
        let mut reg = setup_registry();
        let e = reg.create();
        reg.add(e, Health(100)).unwrap();
        reg.add(e, Position { x: 0.0, y: 0.0 }).unwrap();
        assert_eq!(reg.get::<Health>(e), Ok(&Health(100)));
        reg.update(e, Health(42)).unwrap();
        assert_eq!(reg.get::<Health>(e), Ok(&Health(42)));
    }
}
