//! The registry facade: entity lifecycle and the add/remove/update/get/has
//! operations that drive archetype transitions.
//!
//! `Registry` owns the component-type registrar, the archetype store (keyed
//! by [`ArchetypeId`]), and the entity index. A structural mutation follows
//! the same three-step shape every time: locate the entity's current
//! archetype, obtain the neighbouring archetype along the relevant
//! component's graph edge (materialising it lazily if needed), and transfer
//! the entity's row via an [`Entry`](crate::archetype::Entry).

use std::collections::HashMap;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::{ComponentRegistry, ComponentTypeId};
use crate::entity::{EntityId, EntityIndex};
use crate::view::{View, ViewIter, ViewIterMut};
use crate::EcsError;

/// The top-level ECS container: component registrar, archetype store, and
/// entity index.
#[derive(Debug)]
pub struct Registry {
    components: ComponentRegistry,
    archetypes: HashMap<ArchetypeId, Archetype>,
    entities: EntityIndex,
}

impl Registry {
    /// Construct a registry with just the root archetype present and slot 0
    /// reserved.
    pub fn new() -> Self {
        let mut archetypes = HashMap::new();
        archetypes.insert(ArchetypeId::ROOT, Archetype::new(ArchetypeId::ROOT, Vec::new()));
        Self {
            components: ComponentRegistry::new(),
            archetypes,
            entities: EntityIndex::new(ArchetypeId::ROOT),
        }
    }

    /// Number of currently alive entities.
    pub fn alive_count(&self) -> usize {
        self.entities.alive_count()
    }

    /// Number of archetypes materialised so far (always at least 1, for the root).
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Whether `e` refers to a currently alive entity with a matching generation.
    pub fn is_alive(&self, e: EntityId) -> bool {
        self.entities.validate(e).is_some()
    }

    pub(crate) fn component_type_id<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.components.lookup::<T>()
    }

    pub(crate) fn archetype(&self, id: ArchetypeId) -> &Archetype {
        self.archetypes.get(&id).expect("archetype id must be materialised")
    }

    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        self.archetypes.get_mut(&id).expect("archetype id must be materialised")
    }

    pub(crate) fn matching_archetype_ids(&self, required: &[ComponentTypeId]) -> Vec<ArchetypeId> {
        self.archetypes
            .keys()
            .copied()
            .filter(|id| required.iter().all(|c| id.has(*c)))
            .collect()
    }

    fn validate(&self, e: EntityId) -> Result<u32, EcsError> {
        self.entities.validate(e).ok_or(EcsError::InvalidEntity(e))
    }

    /// Allocate a fresh entity, recycling a retired slot if one is available.
    /// A freshly created entity starts in the root archetype.
    pub fn create(&mut self) -> EntityId {
        self.entities.create(ArchetypeId::ROOT)
    }

    /// Destroy `e`, returning its slot to the recycle list with an
    /// incremented generation.
    pub fn destroy(&mut self, e: EntityId) -> Result<(), EcsError> {
        let slot = self.validate(e)?;
        let record = self.entities.record(slot);
        let arch = self.archetypes.get_mut(&record.archetype).expect("archetype must exist");
        let entry = arch.remove_entry(record.row)?;
        if !entry.moved_entity.is_none() {
            if let Some(moved_slot) = self.entities.validate(entry.moved_entity) {
                self.entities.set_record(moved_slot, record.archetype, record.row);
            }
        }
        self.entities.retire(slot, ArchetypeId::ROOT);
        Ok(())
    }

    // -- archetype graph ------------------------------------------------

    fn infos_for_mask(&self, mask: u64) -> Vec<crate::component::ComponentInfo> {
        self.components
            .ids_in_mask(mask)
            .into_iter()
            .map(|id| self.components.info(id).expect("registered id has info").clone())
            .collect()
    }

    /// Obtain (materialising on demand) the archetype reached by adding `c`
    /// to `from`.
    fn ensure_plus(&mut self, from: ArchetypeId, c: ComponentTypeId) -> ArchetypeId {
        if let Ok(target) = self.archetypes.get(&from).expect("archetype must exist").get_plus(c) {
            return target;
        }
        let new_id = from.with(c);
        if !self.archetypes.contains_key(&new_id) {
            let infos = self.infos_for_mask(new_id.0);
            self.archetypes.insert(new_id, Archetype::new(new_id, infos));
            tracing::debug!(
                parent = from.0,
                component = c.bit(),
                new_archetype = new_id.0,
                "materialised archetype"
            );
        }
        self.archetypes.get_mut(&from).unwrap().link_plus(c, new_id);
        self.archetypes.get_mut(&new_id).unwrap().link_minus(c, from);
        new_id
    }

    /// Obtain (materialising on demand) the archetype reached by removing
    /// `c` from `from`.
    fn ensure_minus(&mut self, from: ArchetypeId, c: ComponentTypeId) -> ArchetypeId {
        if let Ok(target) = self.archetypes.get(&from).expect("archetype must exist").get_minus(c) {
            return target;
        }
        let new_id = from.without(c);
        if !self.archetypes.contains_key(&new_id) {
            let infos = self.infos_for_mask(new_id.0);
            self.archetypes.insert(new_id, Archetype::new(new_id, infos));
            tracing::debug!(
                parent = from.0,
                component = c.bit(),
                new_archetype = new_id.0,
                "materialised archetype"
            );
        }
        self.archetypes.get_mut(&from).unwrap().link_minus(c, new_id);
        self.archetypes.get_mut(&new_id).unwrap().link_plus(c, from);
        new_id
    }

    // -- structural mutation ---------------------------------------------

    /// Add component `T` to `e`. Fails with [`EcsError::AlreadyHas`] if `e`
    /// already carries a `T`.
    pub fn add<T: Clone + 'static>(&mut self, e: EntityId, value: T) -> Result<(), EcsError> {
        let slot = self.validate(e)?;
        let c = self.components.id_for::<T>()?;
        let record = self.entities.record(slot);
        let src_id = record.archetype;
        if src_id.has(c) {
            return Err(EcsError::AlreadyHas {
                entity: e,
                component: self.components.info(c).unwrap().name,
            });
        }
        let dst_id = self.ensure_plus(src_id, c);
        let vtable = self.components.info(c).unwrap().vtable.clone();

        let mut src_arch = self.archetypes.remove(&src_id).expect("archetype must exist");
        let entry_result = src_arch.remove_entry(record.row);
        self.archetypes.insert(src_id, src_arch);
        let mut entry = entry_result?;

        if !entry.moved_entity.is_none() {
            if let Some(moved_slot) = self.entities.validate(entry.moved_entity) {
                self.entities.set_record(moved_slot, src_id, record.row);
            }
        }

        entry.entity = e;
        entry.insert_value(c, value, vtable);

        let dst_arch = self.archetypes.get_mut(&dst_id).expect("archetype must exist");
        let new_row = dst_arch.add_entry(entry);
        self.entities.set_record(slot, dst_id, new_row);
        Ok(())
    }

    /// Remove component `T` from `e`. Fails with [`EcsError::MissingComponent`]
    /// if `e` does not carry a `T`.
    pub fn remove<T: Clone + 'static>(&mut self, e: EntityId) -> Result<(), EcsError> {
        let slot = self.validate(e)?;
        let record = self.entities.record(slot);
        let c = self
            .components
            .lookup::<T>()
            .filter(|c| record.archetype.has(*c))
            .ok_or(EcsError::MissingComponent {
                entity: e,
                component: std::any::type_name::<T>(),
            })?;

        let src_id = record.archetype;
        let dst_id = self.ensure_minus(src_id, c);

        let mut src_arch = self.archetypes.remove(&src_id).expect("archetype must exist");
        let entry_result = src_arch.remove_entry(record.row);
        self.archetypes.insert(src_id, src_arch);
        let mut entry = entry_result?;

        if !entry.moved_entity.is_none() {
            if let Some(moved_slot) = self.entities.validate(entry.moved_entity) {
                self.entities.set_record(moved_slot, src_id, record.row);
            }
        }

        entry.drop_component(c);
        entry.entity = e;

        let dst_arch = self.archetypes.get_mut(&dst_id).expect("archetype must exist");
        let new_row = dst_arch.add_entry(entry);
        self.entities.set_record(slot, dst_id, new_row);
        Ok(())
    }

    /// Overwrite the value of an already-present component `T` in place;
    /// never triggers a structural transition.
    pub fn update<T: Clone + 'static>(&mut self, e: EntityId, value: T) -> Result<(), EcsError> {
        let slot = self.validate(e)?;
        let record = self.entities.record(slot);
        let c = self
            .components
            .lookup::<T>()
            .filter(|c| record.archetype.has(*c))
            .ok_or(EcsError::MissingComponent {
                entity: e,
                component: std::any::type_name::<T>(),
            })?;
        let arch = self.archetypes.get_mut(&record.archetype).expect("archetype must exist");
        #[allow(unsafe_code)]
        let slot_ref = unsafe { arch.get_component_mut::<T>(record.row, c) }.ok_or(
            EcsError::MissingComponent { entity: e, component: std::any::type_name::<T>() },
        )?;
        *slot_ref = value;
        Ok(())
    }

    /// `add` if `e` does not already carry a `T`, else a no-op. Returns
    /// whether the component was actually added.
    pub fn try_add<T: Clone + 'static>(&mut self, e: EntityId, value: T) -> Result<bool, EcsError> {
        match self.add(e, value) {
            Ok(()) => Ok(true),
            Err(EcsError::AlreadyHas { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// `update` if `e` already carries a `T`, else `add`.
    pub fn add_or_update<T: Clone + 'static>(&mut self, e: EntityId, value: T) -> Result<(), EcsError> {
        match self.update(e, value.clone()) {
            Ok(()) => Ok(()),
            Err(EcsError::MissingComponent { .. }) => self.add(e, value),
            Err(other) => Err(other),
        }
    }

    /// `remove` if `e` carries a `T`, else a no-op. Returns whether the
    /// component was actually removed.
    pub fn try_remove<T: Clone + 'static>(&mut self, e: EntityId) -> Result<bool, EcsError> {
        match self.remove::<T>(e) {
            Ok(()) => Ok(true),
            Err(EcsError::MissingComponent { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// `try_remove` folded over every type in `S`.
    pub fn try_remove_all<S: RemovableSet>(&mut self, e: EntityId) -> Result<(), EcsError> {
        S::try_remove_all(self, e)
    }

    /// Whether `e`'s archetype carries every component type in `S`. An empty
    /// pack is vacuously true.
    pub fn has<S: ComponentSet>(&self, e: EntityId) -> Result<bool, EcsError> {
        let slot = self.validate(e)?;
        let record = self.entities.record(slot);
        let ids = S::type_ids(self);
        Ok(ids.iter().all(|id| match id {
            Some(c) => record.archetype.has(*c),
            None => false,
        }))
    }

    /// A reference to component `T` on `e`. The reference is valid only
    /// until the next structural mutation on this or any entity sharing the
    /// archetype.
    pub fn get<T: 'static>(&self, e: EntityId) -> Result<&T, EcsError> {
        let slot = self.validate(e)?;
        let record = self.entities.record(slot);
        let c = self.components.lookup::<T>().ok_or(EcsError::MissingComponent {
            entity: e,
            component: std::any::type_name::<T>(),
        })?;
        let arch = self.archetypes.get(&record.archetype).expect("archetype must exist");
        #[allow(unsafe_code)]
        unsafe { arch.get_component::<T>(record.row, c) }.ok_or(EcsError::MissingComponent {
            entity: e,
            component: std::any::type_name::<T>(),
        })
    }

    /// A mutable reference to component `T` on `e`. See [`get`](Self::get)
    /// for the reference's validity window.
    pub fn get_mut<T: 'static>(&mut self, e: EntityId) -> Result<&mut T, EcsError> {
        let slot = self.validate(e)?;
        let record = self.entities.record(slot);
        let c = self.components.lookup::<T>().ok_or(EcsError::MissingComponent {
            entity: e,
            component: std::any::type_name::<T>(),
        })?;
        let arch = self.archetypes.get_mut(&record.archetype).expect("archetype must exist");
        #[allow(unsafe_code)]
        unsafe { arch.get_component_mut::<T>(record.row, c) }.ok_or(EcsError::MissingComponent {
            entity: e,
            component: std::any::type_name::<T>(),
        })
    }

    /// `false` if `e` lacks `T`, else `Some` of the value.
    pub fn try_get<T: 'static>(&self, e: EntityId) -> Option<&T> {
        self.get::<T>(e).ok()
    }

    /// Read each component type in `S` by copy; all must be present.
    pub fn gett<S: GetTuple>(&self, e: EntityId) -> Result<S::Output, EcsError> {
        S::gett(self, e)
    }

    // -- views -------------------------------------------------------------

    /// A read-only multi-component scan over every archetype whose id is a
    /// superset of `V`'s mask.
    ///
    /// # Panics
    ///
    /// Panics if `V` contains a `&mut T` item; use [`view_mut`](Self::view_mut)
    /// for mutable views, which requires `&mut self`.
    pub fn view<V: View>(&self) -> ViewIter<'_, V> {
        assert!(
            !V::HAS_MUTABLE,
            "Registry::view() cannot be used with mutable view items (&mut T); \
             use Registry::view_mut() instead."
        );
        let archetypes = match V::type_ids(self) {
            Some(type_ids) => self.matching_archetype_ids(&type_ids),
            None => Vec::new(),
        };
        ViewIter::new(self, archetypes)
    }

    /// A mutable multi-component scan over every archetype whose id is a
    /// superset of `V`'s mask. Requires `&mut self`, which guarantees
    /// exclusive access for the iterator's lifetime.
    pub fn view_mut<V: View>(&mut self) -> ViewIterMut<'_, V> {
        V::validate_no_access_conflicts(self);
        let archetypes = match V::type_ids(self) {
            Some(type_ids) => self.matching_archetype_ids(&type_ids),
            None => Vec::new(),
        };
        ViewIterMut::new(self, archetypes)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ComponentSet / RemovableSet / GetTuple -- variadic Ts… packs
// ---------------------------------------------------------------------------

/// A tuple of component types used as a pack for [`Registry::has`].
pub trait ComponentSet {
    fn type_ids(registry: &Registry) -> Vec<Option<ComponentTypeId>>;
}

impl ComponentSet for () {
    fn type_ids(_registry: &Registry) -> Vec<Option<ComponentTypeId>> {
        Vec::new()
    }
}

/// A tuple of component types used as a pack for [`Registry::try_remove_all`].
pub trait RemovableSet {
    fn try_remove_all(registry: &mut Registry, e: EntityId) -> Result<(), EcsError>;
}

/// A tuple of component types used as a pack for [`Registry::gett`].
pub trait GetTuple {
    type Output;
    fn gett(registry: &Registry, e: EntityId) -> Result<Self::Output, EcsError>;
}

macro_rules! impl_component_packs {
    ($($name:ident),+) => {
        impl<$($name: 'static),+> ComponentSet for ($($name,)+) {
            fn type_ids(registry: &Registry) -> Vec<Option<ComponentTypeId>> {
                vec![$(registry.component_type_id::<$name>()),+]
            }
        }

        impl<$($name: Clone + 'static),+> RemovableSet for ($($name,)+) {
            fn try_remove_all(registry: &mut Registry, e: EntityId) -> Result<(), EcsError> {
                $(registry.try_remove::<$name>(e)?;)+
                Ok(())
            }
        }

        impl<$($name: Clone + 'static),+> GetTuple for ($($name,)+) {
            type Output = ($($name,)+);
            fn gett(registry: &Registry, e: EntityId) -> Result<Self::Output, EcsError> {
                Ok(($(registry.get::<$name>(e)?.clone(),)+))
            }
        }
    };
}

impl_component_packs!(A);
impl_component_packs!(A, B);
impl_component_packs!(A, B, C);
impl_component_packs!(A, B, C, D);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    // -- S1: add/get basic --------------------------------------------------
    #[test]
    fn s1_add_get_basic() {
        let mut reg = Registry::new();
        let e1 = reg.create();
        reg.add(e1, 12i32).unwrap();
        reg.add(e1, 24.12f32).unwrap();
        assert_eq!(*reg.get::<i32>(e1).unwrap(), 12);
        assert_eq!(*reg.get::<f32>(e1).unwrap(), 24.12);
    }

    // -- S2: tryAdd preserves first value ------------------------------------
    #[test]
    fn s2_try_add_preserves_first_value() {
        let mut reg = Registry::new();
        let e1 = reg.create();
        reg.add(e1, 12i32).unwrap();
        assert!(!reg.try_add(e1, 14i32).unwrap());
        assert_eq!(*reg.get::<i32>(e1).unwrap(), 12);
    }

    // -- S3: addOrUpdate ------------------------------------------------------
    #[test]
    fn s3_add_or_update() {
        let mut reg = Registry::new();
        let e1 = reg.create();
        reg.add_or_update(e1, 21i32).unwrap();
        reg.add_or_update(e1, 14i32).unwrap();
        assert_eq!(*reg.get::<i32>(e1).unwrap(), 14);
    }

    // -- S4: removal ----------------------------------------------------------
    #[test]
    fn s4_removal() {
        let mut reg = Registry::new();
        let e1 = reg.create();
        reg.add(e1, 12i32).unwrap();
        reg.add(e1, 24.0f32).unwrap();
        reg.remove::<i32>(e1).unwrap();
        assert!(!reg.has::<(i32,)>(e1).unwrap());
        assert_eq!(*reg.get::<f32>(e1).unwrap(), 24.0);
    }

    // -- S5: swap-remove integrity ---------------------------------------------
    #[test]
    fn s5_swap_remove_integrity() {
        let mut reg = Registry::new();
        let e1 = reg.create();
        let e2 = reg.create();
        reg.add(e1, 1i32).unwrap();
        reg.add(e2, 2i32).unwrap();
        reg.destroy(e1).unwrap();
        assert_eq!(*reg.get::<i32>(e2).unwrap(), 2);
    }

    // -- S6: multi-component view ----------------------------------------------
    #[test]
    fn s6_multi_component_view() {
        let mut reg = Registry::new();
        let mut entities = Vec::new();
        for i in 0..10 {
            let e = reg.create();
            reg.add(e, i + 1).unwrap();
            if i % 2 == 0 {
                reg.add(e, (i as f32) + 1.0001).unwrap();
            }
            entities.push(e);
        }

        let mut visited = 0;
        for (_entity, (_f, i)) in reg.view_mut::<(&mut f32, &mut i32)>() {
            *i = 1224;
            visited += 1;
        }
        assert_eq!(visited, 5);

        let mut at_1224 = 0;
        let mut original = 0;
        for (_entity, (i,)) in reg.view::<(&i32,)>() {
            if *i == 1224 {
                at_1224 += 1;
            } else {
                original += 1;
            }
        }
        assert_eq!(at_1224, 5);
        assert_eq!(original, 5);
    }

    // -- S7: recycling with generation ------------------------------------------
    #[test]
    fn s7_recycling_with_generation() {
        let mut reg = Registry::new();
        let e1 = reg.create();
        reg.destroy(e1).unwrap();
        let e1p = reg.create();
        assert_eq!(e1p.slot(), e1.slot());
        assert_eq!(e1p.generation(), e1.generation() + 1);
    }

    #[test]
    fn already_has_rejected() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.add(e, Pos { x: 0.0, y: 0.0 }).unwrap();
        let err = reg.add(e, Pos { x: 1.0, y: 1.0 }).unwrap_err();
        assert!(matches!(err, EcsError::AlreadyHas { .. }));
    }

    #[test]
    fn missing_component_rejected() {
        let mut reg = Registry::new();
        let e = reg.create();
        assert!(matches!(
            reg.remove::<Pos>(e).unwrap_err(),
            EcsError::MissingComponent { .. }
        ));
        assert!(matches!(
            reg.update(e, Pos { x: 0.0, y: 0.0 }).unwrap_err(),
            EcsError::MissingComponent { .. }
        ));
        assert!(matches!(
            reg.get::<Pos>(e).unwrap_err(),
            EcsError::MissingComponent { .. }
        ));
    }

    #[test]
    fn invalid_entity_rejected() {
        let mut reg = Registry::new();
        assert!(matches!(
            reg.add(EntityId::new(0, 0), Pos { x: 0.0, y: 0.0 }).unwrap_err(),
            EcsError::InvalidEntity(_)
        ));
        let e = reg.create();
        reg.destroy(e).unwrap();
        assert!(matches!(
            reg.add(e, Pos { x: 0.0, y: 0.0 }).unwrap_err(),
            EcsError::InvalidEntity(_)
        ));
    }

    #[test]
    fn stale_generation_rejected_after_recycle() {
        let mut reg = Registry::new();
        let e0 = reg.create();
        reg.add(e0, Pos { x: 0.0, y: 0.0 }).unwrap();
        reg.destroy(e0).unwrap();
        let e1 = reg.create();
        reg.add(e1, Pos { x: 9.0, y: 9.0 }).unwrap();
        // e0 is stale even though its slot has been recycled.
        assert!(matches!(reg.get::<Pos>(e0).unwrap_err(), EcsError::InvalidEntity(_)));
        assert_eq!(*reg.get::<Pos>(e1).unwrap(), Pos { x: 9.0, y: 9.0 });
    }

    #[test]
    fn round_trip_add_remove_preserves_archetype() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.add(e, Pos { x: 1.0, y: 2.0 }).unwrap();
        assert!(reg.has::<(Pos,)>(e).unwrap());

        reg.add(e, Vel { dx: 0.0, dy: 0.0 }).unwrap();
        reg.remove::<Vel>(e).unwrap();

        assert!(reg.has::<(Pos,)>(e).unwrap());
        assert!(!reg.has::<(Vel,)>(e).unwrap());
        assert_eq!(*reg.get::<Pos>(e).unwrap(), Pos { x: 1.0, y: 2.0 });
    }

    #[test]
    fn try_remove_all_folds_over_pack() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.add(e, Pos { x: 1.0, y: 1.0 }).unwrap();
        reg.try_remove_all::<(Pos, Vel)>(e).unwrap();
        assert!(!reg.has::<(Pos,)>(e).unwrap());
    }

    #[test]
    fn gett_reads_multiple_by_copy() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.add(e, Pos { x: 1.0, y: 2.0 }).unwrap();
        reg.add(e, Vel { dx: 3.0, dy: 4.0 }).unwrap();
        let (pos, vel) = reg.gett::<(Pos, Vel)>(e).unwrap();
        assert_eq!(pos, Pos { x: 1.0, y: 2.0 });
        assert_eq!(vel, Vel { dx: 3.0, dy: 4.0 });
    }

    #[test]
    fn empty_pack_has_is_vacuously_true() {
        let reg = Registry::new();
        let e = EntityId::new(0, 0); // never valid, but we just check the type-level API
        let _ = e;
        let mut reg = reg;
        let e = reg.create();
        assert!(reg.has::<()>(e).unwrap());
    }

    #[test]
    fn graph_edges_are_symmetric() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.add(e, Pos { x: 0.0, y: 0.0 }).unwrap();
        reg.add(e, Vel { dx: 0.0, dy: 0.0 }).unwrap();
        // Exactly 3 archetypes should have been materialised: {}, {Pos}, {Pos,Vel}.
        assert_eq!(reg.archetype_count(), 3);
    }
}
