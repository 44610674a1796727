//! Compilation units and the lists that hold them
//!
//! Units live in an arena and are addressed by generation-checked handles.
//! Each arena slot carries its own list links, so a unit can be linked into
//! at most one of the three lists at a time and unlinking is O(1) given the
//! handle:
//!
//! - **Pending**: queued for the worker, in enqueue order
//! - **Active**: compiled, native code loaded, candidates for eviction
//! - **Retired**: compacted artifacts kept until shutdown
//!
//! All mutation happens under the engine mutex, so the arena itself is a
//! plain single-threaded structure.

use crate::method::{MethodBody, MethodId, NativeRoutine, RoutineState};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Monotonically increasing unit number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable reference to a unit in the arena.
///
/// A handle outlives the unit it names; lookups through a stale handle
/// return `None` instead of reaching a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    index: u32,
    generation: u32,
}

/// Which list a unit is linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Pending,
    Active,
    Retired,
}

impl ListKind {
    pub const ALL: [ListKind; 3] = [ListKind::Pending, ListKind::Active, ListKind::Retired];

    fn slot(self) -> usize {
        match self {
            ListKind::Pending => 0,
            ListKind::Active => 1,
            ListKind::Retired => 2,
        }
    }
}

/// Loaded native code.
///
/// Dropping the value unloads the code; the engine guarantees that happens
/// only when no live stack can be executing it.
pub trait NativeCode: Send {
    /// Entry point compiled for `unit`, if this object contains one
    fn entry(&self, unit: UnitId) -> Option<NativeRoutine>;
}

/// One compiled or compiling method body
pub struct Unit {
    id: UnitId,
    method_id: Option<MethodId>,
    method: Option<Weak<MethodBody>>,
    used_code_p: bool,
    code: Option<Box<dyn NativeCode>>,
}

impl Unit {
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// The method body, if it has not been collected
    pub fn method(&self) -> Option<Arc<MethodBody>> {
        self.method.as_ref().and_then(Weak::upgrade)
    }

    /// Identity of the method this unit was created for
    pub fn method_id(&self) -> Option<MethodId> {
        self.method_id
    }

    /// Whether the back-referenced method body is gone
    pub fn method_collected(&self) -> bool {
        self.method().is_none()
    }

    /// Call count of the back-referenced method body
    pub fn total_calls(&self) -> Option<u64> {
        self.method().map(|m| m.total_calls())
    }

    pub fn used_code_p(&self) -> bool {
        self.used_code_p
    }

    pub(crate) fn set_used_code_p(&mut self, used: bool) {
        self.used_code_p = used;
    }

    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }

    pub fn code(&self) -> Option<&dyn NativeCode> {
        self.code.as_deref()
    }

    /// Attach loaded code, replacing (and unloading) any previous code
    pub fn attach_code(&mut self, code: Box<dyn NativeCode>) {
        self.code = Some(code);
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("method_id", &self.method_id)
            .field("used_code_p", &self.used_code_p)
            .field("has_code", &self.code.is_some())
            .finish()
    }
}

/// Head of one list: first and last node plus the count
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl UnitList {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    list: Option<ListKind>,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Entry {
    unit: Unit,
    link: Link,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena owning every unit of the engine
pub struct UnitArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    lists: [UnitList; 3],
    by_method: FxHashMap<MethodId, UnitHandle>,
    next_id: u64,
}

impl UnitArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            lists: [UnitList::default(); 3],
            by_method: FxHashMap::default(),
            next_id: 0,
        }
    }

    fn alloc(&mut self, unit: Unit) -> UnitHandle {
        let entry = Entry {
            unit,
            link: Link::default(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            UnitHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).expect("unit arena exhausted");
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            UnitHandle {
                index,
                generation: 0,
            }
        }
    }

    fn next_unit_id(&mut self) -> UnitId {
        let id = UnitId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create an unlinked unit for `method` and map the method to it
    pub fn create(&mut self, method: &Arc<MethodBody>) -> UnitHandle {
        let id = self.next_unit_id();
        let handle = self.alloc(Unit {
            id,
            method_id: Some(method.id()),
            method: Some(Arc::downgrade(method)),
            used_code_p: false,
            code: None,
        });
        self.by_method.insert(method.id(), handle);
        handle
    }

    /// Create an unlinked unit that owns `code` but no method body
    pub fn create_detached(&mut self, code: Box<dyn NativeCode>) -> UnitHandle {
        let id = self.next_unit_id();
        self.alloc(Unit {
            id,
            method_id: None,
            method: None,
            used_code_p: false,
            code: Some(code),
        })
    }

    fn entry(&self, handle: UnitHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: UnitHandle) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    fn link_at(&mut self, index: u32) -> &mut Link {
        &mut self.slots[index as usize]
            .entry
            .as_mut()
            .expect("list link points at an empty slot")
            .link
    }

    fn handle_at(&self, index: u32) -> UnitHandle {
        UnitHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    pub fn get(&self, handle: UnitHandle) -> Option<&Unit> {
        self.entry(handle).map(|e| &e.unit)
    }

    pub fn get_mut(&mut self, handle: UnitHandle) -> Option<&mut Unit> {
        self.entry_mut(handle).map(|e| &mut e.unit)
    }

    pub fn contains(&self, handle: UnitHandle) -> bool {
        self.entry(handle).is_some()
    }

    /// The list `handle` is linked into, if any
    pub fn list_of(&self, handle: UnitHandle) -> Option<ListKind> {
        self.entry(handle).and_then(|e| e.link.list)
    }

    pub fn list(&self, kind: ListKind) -> &UnitList {
        &self.lists[kind.slot()]
    }

    pub fn len(&self, kind: ListKind) -> usize {
        self.list(kind).len()
    }

    /// Number of units alive in the arena, linked or not
    pub fn live_units(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Append an unlinked unit to the tail of `kind`
    pub fn push_back(&mut self, kind: ListKind, handle: UnitHandle) {
        let tail = self.lists[kind.slot()].tail;
        let entry = self.entry_mut(handle).expect("push of a freed unit");
        assert!(
            entry.link.list.is_none(),
            "unit {} is already linked into {:?}",
            entry.unit.id,
            entry.link.list
        );
        entry.link = Link {
            list: Some(kind),
            prev: tail,
            next: None,
        };
        match tail {
            Some(t) => self.link_at(t).next = Some(handle.index),
            None => self.lists[kind.slot()].head = Some(handle.index),
        }
        let list = &mut self.lists[kind.slot()];
        list.tail = Some(handle.index);
        list.len += 1;
    }

    /// Unlink `handle` from whatever list holds it.
    ///
    /// Returns the list it was removed from.
    pub fn unlink(&mut self, handle: UnitHandle) -> Option<ListKind> {
        let link = self.entry(handle)?.link;
        let kind = link.list?;
        match link.prev {
            Some(p) => self.link_at(p).next = link.next,
            None => self.lists[kind.slot()].head = link.next,
        }
        match link.next {
            Some(n) => self.link_at(n).prev = link.prev,
            None => self.lists[kind.slot()].tail = link.prev,
        }
        self.lists[kind.slot()].len -= 1;
        if let Some(entry) = self.entry_mut(handle) {
            entry.link = Link::default();
        }
        Some(kind)
    }

    /// Unlink and return the first unit of `kind`
    pub fn pop_front(&mut self, kind: ListKind) -> Option<UnitHandle> {
        let head = self.lists[kind.slot()].head?;
        let handle = self.handle_at(head);
        self.unlink(handle);
        Some(handle)
    }

    /// Handles of `kind` in list order
    pub fn handles(&self, kind: ListKind) -> Vec<UnitHandle> {
        self.iter(kind).collect()
    }

    pub fn iter(&self, kind: ListKind) -> ListIter<'_> {
        ListIter {
            arena: self,
            next: self.lists[kind.slot()].head,
        }
    }

    /// Release a unit.
    ///
    /// The unit must already be unlinked. If its method body is still alive
    /// the method falls back to interpreted execution for good.
    pub fn free(&mut self, handle: UnitHandle) -> Option<Unit> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        assert!(
            entry.link.list.is_none(),
            "unit {} freed while linked into {:?}",
            entry.unit.id,
            entry.link.list
        );
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        let unit = entry.unit;
        if let Some(method_id) = unit.method_id {
            if self.by_method.get(&method_id) == Some(&handle) {
                self.by_method.remove(&method_id);
            }
        }
        if let Some(method) = unit.method() {
            method.routine_slot().store(RoutineState::NotCompiled);
        }
        Some(unit)
    }

    /// Unlink and free every unit of `kind`; returns how many were released
    pub fn free_list(&mut self, kind: ListKind) -> usize {
        let mut freed = 0;
        while let Some(handle) = self.pop_front(kind) {
            self.free(handle);
            freed += 1;
        }
        freed
    }

    /// The unit currently compiled or compiling for `method`
    pub fn unit_for_method(&self, method: MethodId) -> Option<UnitHandle> {
        self.by_method
            .get(&method)
            .copied()
            .filter(|h| self.contains(*h))
    }

    /// Forget the back-reference of the unit made for `method`.
    ///
    /// The unit itself stays where it is; eviction and shutdown free it.
    pub fn detach_method(&mut self, method: MethodId) -> Option<UnitHandle> {
        let handle = self.by_method.remove(&method)?;
        let unit = self.get_mut(handle)?;
        unit.method = None;
        Some(handle)
    }
}

impl Default for UnitArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UnitArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitArena")
            .field("pending", &self.len(ListKind::Pending))
            .field("active", &self.len(ListKind::Active))
            .field("retired", &self.len(ListKind::Retired))
            .field("live_units", &self.live_units())
            .finish()
    }
}

/// Iterator over the handles of one list, head to tail
pub struct ListIter<'a> {
    arena: &'a UnitArena,
    next: Option<u32>,
}

impl Iterator for ListIter<'_> {
    type Item = UnitHandle;

    fn next(&mut self) -> Option<UnitHandle> {
        let index = self.next?;
        let handle = self.arena.handle_at(index);
        self.next = self.arena.entry(handle).and_then(|e| e.link.next);
        Some(handle)
    }
}
