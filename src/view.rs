//! Views: iterate entities by component set.
//!
//! A view resolves which archetypes carry every required component and
//! yields `(EntityId, (&C1, &C2, ...))` tuples for each matching row, row by
//! row, archetype by archetype.
//!
//! ## Soundness
//!
//! Read-only views (`&T`) use [`Registry::view`], which takes `&self`.
//! Mutable views (`&mut T`) use [`Registry::view_mut`], which takes
//! `&mut self`, guaranteeing exclusive access and preventing aliasing UB.
//! The traits below delegate all unsafe archetype access to the `archetype`
//! module; this module only carries `#[allow(unsafe_code)]` on the specific
//! fetch implementations that need raw pointer casts for `&mut T`.

use crate::archetype::ArchetypeId;
use crate::component::ComponentTypeId;
use crate::entity::EntityId;
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// ViewItem trait -- describes one element in a view tuple
// ---------------------------------------------------------------------------

/// A single element of a view fetch: `&T` (read) or `&mut T` (write).
pub trait ViewItem {
    /// The output type yielded per-row.
    type Item<'w>;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;
    /// The concrete component type's ID, if the type has been registered.
    fn component_type_id(registry: &Registry) -> Option<ComponentTypeId>;
    /// Fetch one item from an archetype row.
    fn fetch(registry: &Registry, archetype: ArchetypeId, row: usize) -> Self::Item<'_>;
}

impl<T: 'static> ViewItem for &T {
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn component_type_id(registry: &Registry) -> Option<ComponentTypeId> {
        registry.component_type_id::<T>()
    }

    fn fetch(registry: &Registry, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
        let type_id = registry.component_type_id::<T>().expect("registered by type_ids");
        #[allow(unsafe_code)]
        unsafe {
            registry
                .archetype(archetype)
                .get_component::<T>(row, type_id)
                .expect("row/component presence guaranteed by view matching")
        }
    }
}

// Safety: only reachable through `Registry::view_mut(&mut self)`, which
// guarantees exclusive access to the registry. The `&mut self` receiver on
// `view_mut` prevents any concurrent borrow, making the cast sound.
impl<T: 'static> ViewItem for &mut T {
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn component_type_id(registry: &Registry) -> Option<ComponentTypeId> {
        registry.component_type_id::<T>()
    }

    fn fetch(registry: &Registry, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
        let type_id = registry.component_type_id::<T>().expect("registered by type_ids");
        #[allow(unsafe_code)]
        unsafe {
            let registry_ptr = registry as *const Registry as *mut Registry;
            (*registry_ptr)
                .archetype_mut(archetype)
                .get_component_mut::<T>(row, type_id)
                .expect("row/component presence guaranteed by view matching")
        }
    }
}

// ---------------------------------------------------------------------------
// View trait -- a tuple of ViewItems
// ---------------------------------------------------------------------------

/// A tuple of view items: `(&A, &B)`, `(&mut A, &B)`, etc.
pub trait View {
    type Item<'w>;
    const HAS_MUTABLE: bool;
    fn type_ids(registry: &Registry) -> Option<Vec<ComponentTypeId>>;
    /// Panics if the same component type appears as `&mut T` more than once,
    /// or overlaps a `&T` of the same type.
    fn validate_no_access_conflicts(registry: &Registry);
    fn fetch_row(registry: &Registry, archetype: ArchetypeId, row: usize) -> Self::Item<'_>;
}

fn check_conflicts(items: &[(bool, Option<ComponentTypeId>)]) {
    let mut mutable_ids: Vec<ComponentTypeId> = Vec::new();
    let mut read_ids: Vec<ComponentTypeId> = Vec::new();
    for &(is_mutable, type_id) in items {
        let Some(id) = type_id else { continue };
        if is_mutable {
            if mutable_ids.contains(&id) {
                panic!("view contains duplicate mutable access to the same component type");
            }
            if read_ids.contains(&id) {
                panic!("view contains overlapping read and mutable access to the same component type");
            }
            mutable_ids.push(id);
        } else {
            if mutable_ids.contains(&id) {
                panic!("view contains overlapping read and mutable access to the same component type");
            }
            read_ids.push(id);
        }
    }
}

macro_rules! impl_view_tuple {
    ($($name:ident),+) => {
        impl<$($name: ViewItem),+> View for ($($name,)+) {
            type Item<'w> = ($($name::Item<'w>,)+);
            const HAS_MUTABLE: bool = { false $(|| $name::MUTABLE)+ };

            fn type_ids(registry: &Registry) -> Option<Vec<ComponentTypeId>> {
                Some(vec![$($name::component_type_id(registry)?),+])
            }

            fn validate_no_access_conflicts(registry: &Registry) {
                let ids = [$(($name::MUTABLE, $name::component_type_id(registry))),+];
                check_conflicts(&ids);
            }

            fn fetch_row(registry: &Registry, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
                ($($name::fetch(registry, archetype, row),)+)
            }
        }
    };
}

impl_view_tuple!(A);
impl_view_tuple!(A, B);
impl_view_tuple!(A, B, C);
impl_view_tuple!(A, B, C, D);

// ---------------------------------------------------------------------------
// ViewIter / ViewIterMut
// ---------------------------------------------------------------------------

/// Iterator yielding `(EntityId, V::Item)` for every entity matching a
/// read-only view, produced by [`Registry::view`].
pub struct ViewIter<'w, V: View> {
    registry: &'w Registry,
    archetypes: Vec<ArchetypeId>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: std::marker::PhantomData<V>,
}

impl<'w, V: View> ViewIter<'w, V> {
    pub(crate) fn new(registry: &'w Registry, archetypes: Vec<ArchetypeId>) -> Self {
        Self {
            registry,
            archetypes,
            arch_cursor: 0,
            row_cursor: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<'w, V: View> Iterator for ViewIter<'w, V> {
    type Item = (EntityId, V::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let arch_id = *self.archetypes.get(self.arch_cursor)?;
            let archetype = self.registry.archetype(arch_id);
            if self.row_cursor < archetype.len() {
                let entity = archetype.entities()[self.row_cursor];
                let item = V::fetch_row(self.registry, arch_id, self.row_cursor);
                self.row_cursor += 1;
                return Some((entity, item));
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

/// Iterator yielding `(EntityId, V::Item)` for every entity matching a
/// mutable view, produced by [`Registry::view_mut`].
///
/// Safety: this borrows `&mut Registry` at construction, so the lifetime
/// `'w` is tied to that exclusive borrow; no other reference can exist for
/// the iterator's lifetime.
pub struct ViewIterMut<'w, V: View> {
    registry: &'w Registry,
    archetypes: Vec<ArchetypeId>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: std::marker::PhantomData<V>,
}

impl<'w, V: View> ViewIterMut<'w, V> {
    pub(crate) fn new(registry: &'w Registry, archetypes: Vec<ArchetypeId>) -> Self {
        Self {
            registry,
            archetypes,
            arch_cursor: 0,
            row_cursor: 0,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<'w, V: View> Iterator for ViewIterMut<'w, V> {
    type Item = (EntityId, V::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let arch_id = *self.archetypes.get(self.arch_cursor)?;
            let archetype = self.registry.archetype(arch_id);
            if self.row_cursor < archetype.len() {
                let entity = archetype.entities()[self.row_cursor];
                let item = V::fetch_row(self.registry, arch_id, self.row_cursor);
                self.row_cursor += 1;
                return Some((entity, item));
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
