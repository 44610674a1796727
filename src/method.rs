//! Method bodies as seen by the JIT engine
//!
//! The runtime owns method bodies; the engine only holds weak references to
//! them. Each body carries its call counter and the routine slot that call
//! sites read to decide between native and interpreted execution.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Runtime-assigned identity of a method body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

const NOT_ADDED: usize = 0;
const NOT_READY: usize = 1;
const NOT_COMPILED: usize = 2;
const LAST_SENTINEL: usize = NOT_COMPILED;

/// Entry address of a compiled routine.
///
/// Addresses at or below the sentinel range are rejected so a routine can
/// never be confused with a slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeRoutine(NonZeroUsize);

impl NativeRoutine {
    pub fn new(addr: usize) -> Option<Self> {
        if addr <= LAST_SENTINEL {
            return None;
        }
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn addr(&self) -> usize {
        self.0.get()
    }
}

/// What a call site finds in a method's routine slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineState {
    /// Never queued
    NotAdded,
    /// Queued or compiling
    NotReady,
    /// Given up on; the method stays interpreted
    NotCompiled,
    /// Native code is attached
    Ready(NativeRoutine),
}

impl RoutineState {
    fn encode(self) -> usize {
        match self {
            RoutineState::NotAdded => NOT_ADDED,
            RoutineState::NotReady => NOT_READY,
            RoutineState::NotCompiled => NOT_COMPILED,
            RoutineState::Ready(routine) => routine.addr(),
        }
    }

    fn decode(raw: usize) -> Self {
        match raw {
            NOT_ADDED => RoutineState::NotAdded,
            NOT_READY => RoutineState::NotReady,
            NOT_COMPILED => RoutineState::NotCompiled,
            addr => NativeRoutine::new(addr)
                .map(RoutineState::Ready)
                .unwrap_or(RoutineState::NotCompiled),
        }
    }
}

/// Lock-free slot holding a `RoutineState`.
///
/// Call sites read it without taking the engine mutex; every write goes
/// through the engine while the mutex is held.
#[derive(Debug, Default)]
pub struct RoutineSlot(AtomicUsize);

impl RoutineSlot {
    pub fn load(&self) -> RoutineState {
        RoutineState::decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: RoutineState) {
        self.0.store(state.encode(), Ordering::Release);
    }

    /// Move from `NotAdded` to `NotReady`; false if someone else already did
    pub(crate) fn claim(&self) -> bool {
        self.0
            .compare_exchange(NOT_ADDED, NOT_READY, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The runtime's in-memory representation of one method
#[derive(Debug)]
pub struct MethodBody {
    id: MethodId,
    name: String,
    total_calls: AtomicU64,
    routine: RoutineSlot,
}

impl MethodBody {
    pub fn new(id: MethodId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            total_calls: AtomicU64::new(0),
            routine: RoutineSlot::default(),
        }
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of calls recorded so far
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Record one call and return the new total
    pub fn record_call(&self) -> u64 {
        self.total_calls.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// Overwrite the call counter (used by hosts restoring profiles)
    pub fn set_total_calls(&self, calls: u64) {
        self.total_calls.store(calls, Ordering::Relaxed);
    }

    pub fn routine(&self) -> RoutineState {
        self.routine.load()
    }

    pub(crate) fn routine_slot(&self) -> &RoutineSlot {
        &self.routine
    }
}
