//! Synchronization core
//!
//! One mutex guards all mutable engine state: the three unit lists, the
//! continuation registry, and the coordination flags. Four condition
//! variables hang off it, each with exactly one job:
//!
//! | Signal | Broadcast by | Waited on by |
//! |--------|--------------|--------------|
//! | `WorkerWakeup` | main threads: new work, pause, stop | worker dispatch loop |
//! | `ClientWakeup` | worker: leaving a compilation step | GC start hook |
//! | `GcWakeup` | GC finish hook | worker before compiling |
//! | `PchWakeup` | worker: bootstrap finished | shutdown |
//!
//! Every access goes through a [`CriticalSection`], and every wait re-checks
//! its predicate in a loop.

use crate::continuation::ContinuationRegistry;
use crate::unit::UnitArena;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Status of the one-time precompiled-header bootstrap.
///
/// Leaves `NotReady` exactly once and never returns to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PchStatus {
    NotReady,
    Success,
    Failed,
}

/// Phase of the background worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerPhase {
    /// No worker thread has been started yet
    NotStarted,
    Bootstrapping,
    Idle,
    Compiling,
    /// Stop observed; finishing up
    Draining,
    Stopped,
}

/// The four signals of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    WorkerWakeup,
    ClientWakeup,
    GcWakeup,
    PchWakeup,
}

/// Running totals kept under the mutex
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub enqueued: u64,
    pub compiled: u64,
    pub failed: u64,
    pub unloaded: u64,
    pub collected: u64,
    pub compactions: u64,
}

/// State guarded by the engine mutex
#[derive(Debug)]
pub struct EngineState {
    pub units: UnitArena,
    pub continuations: ContinuationRegistry,
    /// A collection cycle is running
    pub in_gc: bool,
    /// The worker is inside a compilation step
    pub in_jit: bool,
    pub worker_stopped: bool,
    pub pch_status: PchStatus,
    pub worker_phase: WorkerPhase,
    /// Units promoted to active since the last compaction attempt
    pub promoted_since_compaction: usize,
    pub counters: Counters,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            units: UnitArena::new(),
            continuations: ContinuationRegistry::new(),
            in_gc: false,
            in_jit: false,
            worker_stopped: true,
            pch_status: PchStatus::NotReady,
            worker_phase: WorkerPhase::NotStarted,
            promoted_since_compaction: 0,
            counters: Counters::default(),
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine mutex and its condition variables
#[derive(Debug)]
pub struct Coordinator {
    state: Mutex<EngineState>,
    worker_wakeup: Condvar,
    client_wakeup: Condvar,
    gc_wakeup: Condvar,
    pch_wakeup: Condvar,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_state(EngineState::new())
    }

    pub fn with_state(state: EngineState) -> Self {
        Self {
            state: Mutex::new(state),
            worker_wakeup: Condvar::new(),
            client_wakeup: Condvar::new(),
            gc_wakeup: Condvar::new(),
            pch_wakeup: Condvar::new(),
        }
    }

    /// Acquire the engine mutex.
    ///
    /// Poisoning means another thread panicked mid-update; the lists can no
    /// longer be trusted, so this panics too.
    pub fn enter(&self, label: &'static str) -> CriticalSection<'_> {
        tracing::trace!(label, "critical section start");
        let guard = self.state.lock().expect("JIT engine mutex poisoned");
        CriticalSection {
            coordinator: self,
            guard: Some(guard),
            label,
        }
    }

    /// Acquire the mutex even if a panicking thread poisoned it.
    ///
    /// Only for teardown paths that must record a flag on the way out.
    pub(crate) fn enter_for_teardown(&self, label: &'static str) -> CriticalSection<'_> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        CriticalSection {
            coordinator: self,
            guard: Some(guard),
            label,
        }
    }

    fn condvar(&self, signal: Signal) -> &Condvar {
        match signal {
            Signal::WorkerWakeup => &self.worker_wakeup,
            Signal::ClientWakeup => &self.client_wakeup,
            Signal::GcWakeup => &self.gc_wakeup,
            Signal::PchWakeup => &self.pch_wakeup,
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to [`EngineState`], released on drop
pub struct CriticalSection<'a> {
    coordinator: &'a Coordinator,
    guard: Option<MutexGuard<'a, EngineState>>,
    label: &'static str,
}

impl CriticalSection<'_> {
    /// Wake every thread waiting on `signal`
    pub fn broadcast(&self, signal: Signal) {
        tracing::trace!(label = self.label, ?signal, "broadcast");
        self.coordinator.condvar(signal).notify_all();
    }

    /// Block on `signal` until `condition` turns false.
    ///
    /// The mutex is released while blocked and re-acquired before
    /// `condition` is evaluated again.
    pub fn wait_while<F>(&mut self, signal: Signal, mut condition: F)
    where
        F: FnMut(&mut EngineState) -> bool,
    {
        let label = self.label;
        let guard = self.guard.take().expect("critical section already released");
        let guard = self
            .coordinator
            .condvar(signal)
            .wait_while(guard, |state| {
                let waiting = condition(state);
                if waiting {
                    tracing::trace!(label, ?signal, "waiting");
                }
                waiting
            })
            .expect("JIT engine mutex poisoned");
        self.guard = Some(guard);
    }

    /// Like [`wait_while`](Self::wait_while) but gives up after `timeout`.
    ///
    /// Returns true if the condition still holds, i.e. the wait timed out.
    pub fn wait_timeout_while<F>(&mut self, signal: Signal, timeout: Duration, condition: F) -> bool
    where
        F: FnMut(&mut EngineState) -> bool,
    {
        let guard = self.guard.take().expect("critical section already released");
        let (guard, result) = self
            .coordinator
            .condvar(signal)
            .wait_timeout_while(guard, timeout, condition)
            .expect("JIT engine mutex poisoned");
        self.guard = Some(guard);
        result.timed_out()
    }
}

impl Deref for CriticalSection<'_> {
    type Target = EngineState;

    fn deref(&self) -> &EngineState {
        self.guard.as_ref().expect("critical section already released")
    }
}

impl DerefMut for CriticalSection<'_> {
    fn deref_mut(&mut self) -> &mut EngineState {
        self.guard.as_mut().expect("critical section already released")
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        tracing::trace!(label = self.label, "critical section finish");
    }
}
