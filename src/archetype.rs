//! Archetype storage and the per-component transition graph.
//!
//! An [`Archetype`] stores all entities that share the exact same set of
//! component types. Components are laid out Structure-of-Arrays style: one
//! [`Column`] per component type, plus a parallel `Vec<EntityId>` mapping row
//! index to entity. Archetypes are linked to their neighbours through
//! [`plus`](Archetype::link_plus)/[`minus`](Archetype::link_minus) edges keyed
//! by the single component that differs between them.
//!
//! # Safety
//!
//! This module contains `unsafe` code in [`Column`] because component data is
//! stored as type-erased byte buffers. The safety invariants are upheld by
//! [`Archetype`], which guarantees that every column access uses the
//! [`ComponentVtable`] captured for that column's concrete type.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use crate::component::{ComponentInfo, ComponentTypeId};
use crate::entity::EntityId;
use crate::EcsError;

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype: the bitwise OR of the ids of every component
/// type it contains. The empty archetype (id `0`) is the graph root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u64);

impl ArchetypeId {
    /// The root archetype: no components.
    pub const ROOT: ArchetypeId = ArchetypeId(0);

    #[inline]
    pub(crate) fn with(self, c: ComponentTypeId) -> ArchetypeId {
        ArchetypeId(self.0 | c.bit())
    }

    #[inline]
    pub(crate) fn without(self, c: ComponentTypeId) -> ArchetypeId {
        ArchetypeId(self.0 & !c.bit())
    }

    #[inline]
    pub(crate) fn has(self, c: ComponentTypeId) -> bool {
        self.0 & c.bit() != 0
    }
}

// ---------------------------------------------------------------------------
// ComponentVtable -- type-erased operations for a component type
// ---------------------------------------------------------------------------

/// Function pointers for type-erased move-construct and drop of component
/// values, captured once per component type via [`ComponentVtable::new`].
#[derive(Clone)]
pub struct ComponentVtable {
    pub(crate) drop_fn: unsafe fn(*mut u8),
    pub(crate) size: usize,
    pub(crate) align: usize,
}

impl std::fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

/// Safety: the function pointer is a plain `fn` item produced by generic
/// monomorphization; it captures no state.
unsafe impl Send for ComponentVtable {}
unsafe impl Sync for ComponentVtable {}

impl ComponentVtable {
    /// Build a vtable for a concrete component type `T`.
    pub fn new<T: Clone + 'static>() -> Self {
        unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }

        Self {
            drop_fn: drop_fn_impl::<T>,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    fn layout(&self) -> Layout {
        Layout::from_size_align(self.size, self.align).expect("invalid component layout")
    }
}

// ---------------------------------------------------------------------------
// Column -- type-erased component storage
// ---------------------------------------------------------------------------

/// A type-erased, densely packed array of component values of a single type.
pub struct Column {
    data: *mut u8,
    len: usize,
    capacity: usize,
    item_size: usize,
    item_align: usize,
}

// Column only stores raw bytes; the owning Archetype is exclusively owned,
// never shared across threads without external synchronisation.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    /// Create a new, empty column for a component described by `info`.
    pub fn new(info: &ComponentInfo) -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            item_size: info.size,
            item_align: info.align,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn layout_for_capacity(&self, cap: usize) -> Option<Layout> {
        if self.item_size == 0 || cap == 0 {
            return None;
        }
        Layout::from_size_align(self.item_size * cap, self.item_align).ok()
    }

    fn grow_if_needed(&mut self) {
        if self.len < self.capacity {
            return;
        }
        let new_cap = if self.capacity == 0 { 4 } else { self.capacity * 2 };
        if self.item_size == 0 {
            self.capacity = new_cap;
            return;
        }
        let new_layout = self
            .layout_for_capacity(new_cap)
            .expect("column layout overflow");
        unsafe {
            let new_data = if self.capacity == 0 {
                alloc::alloc(new_layout)
            } else {
                let old_layout = self
                    .layout_for_capacity(self.capacity)
                    .expect("old layout must be valid");
                alloc::realloc(self.data, old_layout, new_layout.size())
            };
            assert!(!new_data.is_null(), "allocation failed");
            self.data = new_data;
        }
        self.capacity = new_cap;
    }

    #[inline]
    fn ptr_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        if self.item_size == 0 {
            return self.item_align as *mut u8;
        }
        unsafe { self.data.add(index * self.item_size) }
    }

    /// Push a value onto the end of the column.
    ///
    /// # Safety
    ///
    /// `value_ptr` must point to a valid, initialised instance of the
    /// column's component type. Ownership is bitwise-moved into the column;
    /// the caller must not drop the source value afterwards.
    pub unsafe fn push_raw(&mut self, value_ptr: *const u8) {
        self.grow_if_needed();
        if self.item_size > 0 {
            let dst = self.data.add(self.len * self.item_size);
            ptr::copy_nonoverlapping(value_ptr, dst, self.item_size);
        }
        self.len += 1;
    }

    /// Get a raw pointer to the element at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len`.
    #[inline]
    pub unsafe fn get_raw(&self, index: usize) -> *const u8 {
        self.ptr_at(index)
    }

    /// Get a mutable raw pointer to the element at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len`.
    #[inline]
    pub unsafe fn get_raw_mut(&mut self, index: usize) -> *mut u8 {
        self.ptr_at(index)
    }

    /// Swap-remove the element at `index`, dropping it via `vtable.drop_fn`
    /// and moving the last element into its place (if it wasn't the last).
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len`; `vtable` must describe the
    /// actual component type stored in this column.
    pub unsafe fn swap_remove(&mut self, index: usize, vtable: &ComponentVtable) {
        debug_assert!(index < self.len);
        let last = self.len - 1;
        if self.item_size > 0 {
            (vtable.drop_fn)(self.ptr_at(index));
            if index != last {
                let src = self.ptr_at(last);
                let dst = self.data.add(index * self.item_size);
                ptr::copy_nonoverlapping(src, dst, self.item_size);
            }
        }
        self.len -= 1;
    }

    /// Swap-remove the element at `index` *without* dropping it, copying its
    /// bytes to `out_ptr` instead. The last element is moved into the gap.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.len`. `out_ptr` must have room for
    /// the column's item size and be properly aligned for the component
    /// type.
    pub unsafe fn swap_remove_and_move(&mut self, index: usize, out_ptr: *mut u8) {
        debug_assert!(index < self.len);
        let last = self.len - 1;
        if self.item_size > 0 {
            ptr::copy_nonoverlapping(self.ptr_at(index), out_ptr, self.item_size);
            if index != last {
                let src = self.ptr_at(last);
                let dst = self.data.add(index * self.item_size);
                ptr::copy_nonoverlapping(src, dst, self.item_size);
            }
        }
        self.len -= 1;
    }

    /// Drop all remaining elements using `vtable.drop_fn`, then deallocate.
    ///
    /// # Safety
    ///
    /// `vtable` must describe the type stored in this column.
    pub unsafe fn drop_all(&mut self, vtable: &ComponentVtable) {
        for i in 0..self.len {
            if self.item_size > 0 {
                (vtable.drop_fn)(self.ptr_at(i));
            }
        }
        if self.item_size > 0 && self.capacity > 0 {
            let layout = self
                .layout_for_capacity(self.capacity)
                .expect("layout must be valid");
            alloc::dealloc(self.data, layout);
        }
        self.data = ptr::null_mut();
        self.len = 0;
        self.capacity = 0;
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RawComponentBuf -- properly-aligned temporary storage for one component
// ---------------------------------------------------------------------------

/// A properly aligned heap buffer holding exactly one component value,
/// produced by [`Archetype::remove_entry`] and consumed by
/// [`Archetype::add_entry`].
///
/// The value is *not* dropped by `Drop` -- only the backing memory is
/// deallocated. Dropping the value (when a transition is abandoned instead
/// of completed) is the responsibility of [`Entry`], which holds the vtable
/// needed to do so.
struct RawComponentBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl RawComponentBuf {
    /// # Safety
    ///
    /// `src` must point to a valid, initialised value of the type described
    /// by `vtable`; ownership of the bytes moves into the returned buffer.
    unsafe fn copy_from(src: *const u8, vtable: &ComponentVtable) -> Self {
        if vtable.size == 0 {
            return Self {
                ptr: vtable.align as *mut u8,
                layout: Layout::from_size_align(0, vtable.align).expect("invalid ZST layout"),
            };
        }
        let layout = vtable.layout();
        let ptr = alloc::alloc(layout);
        assert!(!ptr.is_null(), "allocation failed");
        ptr::copy_nonoverlapping(src, ptr, vtable.size);
        Self { ptr, layout }
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

impl Drop for RawComponentBuf {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { alloc::dealloc(self.ptr, self.layout) };
        }
    }
}

// ---------------------------------------------------------------------------
// Entry -- the bundle produced by remove_entry and consumed by add_entry
// ---------------------------------------------------------------------------

/// The bundle of component values and swap-bookkeeping produced by
/// [`Archetype::remove_entry`] and consumed by [`Archetype::add_entry`].
///
/// Decouples removal from insertion: the caller may freely mutate `self`
/// between the two calls (inserting or deleting exactly one component)
/// without either archetype ever observing a partially-moved row.
pub(crate) struct Entry {
    pub(crate) entity: EntityId,
    /// The entity that was swapped into the vacated row during
    /// `remove_entry`, or [`EntityId::NONE`] if no swap occurred.
    pub(crate) moved_entity: EntityId,
    components: Vec<(ComponentTypeId, RawComponentBuf, ComponentVtable)>,
}

impl Entry {
    fn empty(entity: EntityId) -> Self {
        Self {
            entity,
            moved_entity: EntityId::NONE,
            components: Vec::new(),
        }
    }

    /// Insert a component value into the entry, captured via `vtable`.
    ///
    /// # Safety
    ///
    /// `value_ptr` must point to a valid, initialised instance of the type
    /// described by `vtable`.
    pub(crate) unsafe fn insert(
        &mut self,
        id: ComponentTypeId,
        value_ptr: *const u8,
        vtable: ComponentVtable,
    ) {
        let buf = RawComponentBuf::copy_from(value_ptr, &vtable);
        self.components.push((id, buf, vtable));
    }

    /// Insert a component value into the entry by move, capturing `vtable`
    /// for its later drop or transfer into a column.
    pub(crate) fn insert_value<T: Clone + 'static>(
        &mut self,
        id: ComponentTypeId,
        value: T,
        vtable: ComponentVtable,
    ) {
        let value = std::mem::ManuallyDrop::new(value);
        unsafe {
            self.insert(id, (&*value as *const T) as *const u8, vtable);
        }
    }

    /// Remove a component from the entry, dropping its value in place.
    /// No-op if the entry does not carry that component.
    pub(crate) fn drop_component(&mut self, id: ComponentTypeId) {
        if let Some(pos) = self.components.iter().position(|(cid, _, _)| *cid == id) {
            let (_, buf, vtable) = self.components.remove(pos);
            if vtable.size > 0 {
                unsafe { (vtable.drop_fn)(buf.ptr) };
            }
            // `buf` drops here: deallocates its backing memory only, the
            // value itself was just destructed above.
        }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        for (_, buf, vtable) in self.components.drain(..) {
            if vtable.size > 0 {
                unsafe { (vtable.drop_fn)(buf.ptr) };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

struct ColumnEntry {
    column: Column,
    vtable: ComponentVtable,
}

impl std::fmt::Debug for ColumnEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnEntry").field("column", &self.column).finish()
    }
}

/// One storage bucket per distinct component set. Columns are stored sorted
/// by [`ComponentTypeId`] for deterministic iteration and binary-search
/// lookup; `plus`/`minus` hold the lazily materialised graph edges to
/// neighbouring archetypes.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    columns: Vec<(ComponentTypeId, ColumnEntry)>,
    entities: Vec<EntityId>,
    plus: HashMap<ComponentTypeId, ArchetypeId>,
    minus: HashMap<ComponentTypeId, ArchetypeId>,
}

impl Archetype {
    /// Create a new, empty archetype for `id`, with one column per
    /// `(component id, info, vtable)` triple.
    pub(crate) fn new(id: ArchetypeId, infos: Vec<ComponentInfo>) -> Self {
        let mut columns: Vec<(ComponentTypeId, ColumnEntry)> = infos
            .iter()
            .map(|info| {
                (
                    info.id,
                    ColumnEntry {
                        column: Column::new(info),
                        vtable: info.vtable.clone(),
                    },
                )
            })
            .collect();
        columns.sort_by_key(|(id, _)| *id);

        Self {
            id,
            columns,
            entities: Vec::new(),
            plus: HashMap::new(),
            minus: HashMap::new(),
        }
    }

    #[inline]
    fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.columns.binary_search_by_key(&type_id, |(id, _)| *id).ok()
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The sorted set of component type IDs that define this archetype.
    pub fn component_types(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.columns.iter().map(|(id, _)| *id)
    }

    #[inline]
    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.id.has(type_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// The entity occupying `row`. Fails with [`EcsError::OutOfBounds`] if
    /// `row >= len()`.
    pub fn entity_at(&self, row: usize) -> Result<EntityId, EcsError> {
        self.entities
            .get(row)
            .copied()
            .ok_or(EcsError::OutOfBounds { row, len: self.entities.len() })
    }

    #[inline]
    pub fn has_plus(&self, c: ComponentTypeId) -> bool {
        self.plus.contains_key(&c)
    }

    #[inline]
    pub fn has_minus(&self, c: ComponentTypeId) -> bool {
        self.minus.contains_key(&c)
    }

    /// Follow an existing `plus` edge. Fails with [`EcsError::MissingEdge`]
    /// if the edge has not been materialised.
    pub fn get_plus(&self, c: ComponentTypeId) -> Result<ArchetypeId, EcsError> {
        self.plus.get(&c).copied().ok_or(EcsError::MissingEdge)
    }

    /// Follow an existing `minus` edge. Fails with [`EcsError::MissingEdge`]
    /// if the edge has not been materialised.
    pub fn get_minus(&self, c: ComponentTypeId) -> Result<ArchetypeId, EcsError> {
        self.minus.get(&c).copied().ok_or(EcsError::MissingEdge)
    }

    /// Install a `plus` edge from this archetype to `target` over `c`.
    /// Idempotent when the edge is already installed with the same target.
    pub(crate) fn link_plus(&mut self, c: ComponentTypeId, target: ArchetypeId) {
        self.plus.entry(c).or_insert(target);
    }

    /// Install a `minus` edge from this archetype to `target` over `c`.
    /// Idempotent when the edge is already installed with the same target.
    pub(crate) fn link_minus(&mut self, c: ComponentTypeId, target: ArchetypeId) {
        self.minus.entry(c).or_insert(target);
    }

    /// Remove row `row`, swap-removing from every column and from
    /// `entities`. Returns an [`Entry`] carrying the extracted component
    /// values and any swap bookkeeping the caller must apply.
    ///
    /// The empty archetype (no columns, never populated) short-circuits to
    /// an empty `Entry` regardless of `row` -- it has no real rows to remove.
    pub(crate) fn remove_entry(&mut self, row: usize) -> Result<Entry, EcsError> {
        if self.entities.is_empty() {
            return Ok(Entry::empty(EntityId::NONE));
        }
        if row >= self.entities.len() {
            return Err(EcsError::OutOfBounds { row, len: self.entities.len() });
        }
        let last = self.entities.len() - 1;
        let entity = self.entities[row];
        self.entities.swap_remove(row);

        let mut entry = Entry::empty(entity);
        for (type_id, col_entry) in &mut self.columns {
            let vtable = col_entry.vtable.clone();
            unsafe {
                if vtable.size > 0 {
                    let layout = vtable.layout();
                    let tmp = alloc::alloc(layout);
                    assert!(!tmp.is_null(), "allocation failed");
                    col_entry.column.swap_remove_and_move(row, tmp);
                    entry.insert(*type_id, tmp, vtable);
                    alloc::dealloc(tmp, layout);
                } else {
                    let zst_ptr = vtable.align as *mut u8;
                    col_entry.column.swap_remove_and_move(row, zst_ptr);
                    entry.insert(*type_id, zst_ptr, vtable);
                }
            }
        }

        entry.moved_entity = if row < last {
            self.entities[row]
        } else {
            EntityId::NONE
        };
        Ok(entry)
    }

    /// Append `entry`'s components to the matching columns and its entity to
    /// `entities`, returning the new row index.
    ///
    /// If `entry` carries no components, returns `0` without mutating --
    /// this is the path used when transitioning into the root archetype.
    pub(crate) fn add_entry(&mut self, mut entry: Entry) -> usize {
        if entry.components.is_empty() {
            return 0;
        }
        for (type_id, buf, _vtable) in entry.components.drain(..) {
            let idx = self
                .column_index(type_id)
                .expect("entry component type not present in destination archetype");
            unsafe {
                self.columns[idx].1.column.push_raw(buf.as_ptr());
            }
            // `buf` drops here: deallocates its temp memory only, the value
            // itself now lives in the column (bitwise-moved by push_raw).
        }
        self.entities.push(entry.entity);
        self.entities.len() - 1
    }

    /// Get a reference to a component value.
    ///
    /// # Safety
    ///
    /// `T` must be the actual type stored in the column for `type_id`.
    pub unsafe fn get_component<T: 'static>(&self, row: usize, type_id: ComponentTypeId) -> Option<&T> {
        let idx = self.column_index(type_id)?;
        let entry = &self.columns[idx].1;
        if row >= entry.column.len() {
            return None;
        }
        Some(&*(entry.column.get_raw(row) as *const T))
    }

    /// Get a mutable reference to a component value.
    ///
    /// # Safety
    ///
    /// `T` must be the actual type stored in the column for `type_id`.
    pub unsafe fn get_component_mut<T: 'static>(
        &mut self,
        row: usize,
        type_id: ComponentTypeId,
    ) -> Option<&mut T> {
        let idx = self.column_index(type_id)?;
        let entry = &mut self.columns[idx].1;
        if row >= entry.column.len() {
            return None;
        }
        Some(&mut *(entry.column.get_raw_mut(row) as *mut T))
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for (_type_id, entry) in &mut self.columns {
            unsafe {
                entry.column.drop_all(&entry.vtable);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
