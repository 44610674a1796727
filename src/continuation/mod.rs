//! Continuation registry
//!
//! Tracks execution contexts that can run JIT-ed code but are not the
//! running stack of a living thread (fibers, saved continuations). Eviction
//! and GC marking walk these in addition to the host's thread stacks.
//!
//! Entries form a doubly-linked list threaded through a slab: insertion at
//! the head, O(1) removal given the handle, no ordering guarantee. The
//! registry lives inside [`EngineState`](crate::sync::EngineState), so
//! every operation happens under the engine mutex.

use crate::method::MethodId;
use std::fmt;
use std::sync::Arc;

/// A live execution context whose call stack can be walked
pub trait ExecutionContext: Send + Sync {
    /// Call `f` with the method of every frame currently executing one.
    ///
    /// Frames without a method body (native frames, dummy frames) are
    /// skipped by the implementation.
    fn for_each_frame(&self, f: &mut dyn FnMut(MethodId));
}

/// Registration returned by `Engine::cont_new`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContinuationHandle {
    index: u32,
    generation: u32,
}

struct Node {
    context: Arc<dyn ExecutionContext>,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Doubly-linked registry of live continuations
pub struct ContinuationRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    len: usize,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node_mut(&mut self, index: u32) -> &mut Node {
        self.slots[index as usize]
            .node
            .as_mut()
            .expect("continuation link points at an empty slot")
    }

    /// Insert `context` at the head
    pub fn register(&mut self, context: Arc<dyn ExecutionContext>) -> ContinuationHandle {
        let node = Node {
            context,
            prev: None,
            next: self.head,
        };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                ContinuationHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index =
                    u32::try_from(self.slots.len()).expect("continuation registry exhausted");
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                ContinuationHandle {
                    index,
                    generation: 0,
                }
            }
        };
        if let Some(old_head) = self.head {
            self.node_mut(old_head).prev = Some(handle.index);
        }
        self.head = Some(handle.index);
        self.len += 1;
        handle
    }

    /// Remove a registration. Stale handles are ignored.
    pub fn unregister(&mut self, handle: ContinuationHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation {
            return false;
        }
        let Some(node) = slot.node.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        if let Some(next) = node.next {
            self.node_mut(next).prev = node.prev;
        }
        self.len -= 1;
        true
    }

    /// Contexts from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ExecutionContext>> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let node = self.slots[index as usize].node.as_ref()?;
            cursor = node.next;
            Some(&node.context)
        })
    }

    /// Drop every registration
    pub fn clear(&mut self) -> usize {
        let released = self.len;
        for slot in &mut self.slots {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.head = None;
        self.len = 0;
        released
    }
}

impl Default for ContinuationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContinuationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationRegistry")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
