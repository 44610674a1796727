//! Background compilation worker
//!
//! A single thread owns all calls into the [`Compiler`]. It first builds the
//! precompiled header, then loops pulling units off the pending list:
//!
//! ```text
//! Bootstrapping -> Idle <-> Compiling
//!                   |           |
//!                   +-> Draining -> Stopped
//! ```
//!
//! Stopping is cooperative. The main thread raises the [`StopToken`] and
//! broadcasts `WorkerWakeup`; the worker observes the token at its
//! checkpoints (before waiting, after waking, before taking a unit) and
//! never abandons an in-flight compiler invocation, since a half-written
//! artifact confuses later compiler runs.

use crate::engine::Shared;
use crate::error::CompileError;
use crate::method::{MethodBody, RoutineState};
use crate::scratch::ScratchDir;
use crate::sync::{CriticalSection, PchStatus, Signal, WorkerPhase};
use crate::unit::{ListKind, NativeCode, UnitHandle, UnitId};
use crate::validity::ClassSerialSet;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Input of the one-time header bootstrap
#[derive(Debug)]
pub struct HeaderJob<'a> {
    pub header_path: Option<&'a Path>,
    /// Where the precompiled header must be written
    pub pch_path: &'a Path,
    pub scratch: &'a ScratchDir,
}

/// Input of one unit compilation
#[derive(Debug)]
pub struct CompileJob<'a> {
    pub unit_id: UnitId,
    pub method: &'a Arc<MethodBody>,
    pub pch_path: &'a Path,
    pub scratch: &'a ScratchDir,
    /// Serials that generated inline-cache guards may rely on
    pub class_serials: &'a ClassSerialSet,
}

/// One already-compiled unit taking part in a compaction
#[derive(Debug, Clone)]
pub struct CompactMember {
    pub unit_id: UnitId,
    pub method: Arc<MethodBody>,
}

/// Input of a compaction of every active unit into one artifact
#[derive(Debug)]
pub struct CompactJob<'a> {
    pub members: &'a [CompactMember],
    pub pch_path: &'a Path,
    pub scratch: &'a ScratchDir,
    pub class_serials: &'a ClassSerialSet,
}

/// The native-code compiler driven by the worker.
///
/// Code generation, invoking the system compiler and loading the result are
/// all behind this seam. Every method runs on the worker thread.
pub trait Compiler: Send + Sync {
    /// Build the precompiled header every later compilation reuses
    fn build_header(&self, job: &HeaderJob<'_>) -> Result<(), CompileError>;

    /// Compile and load one unit
    fn compile(&self, job: &CompileJob<'_>) -> Result<Box<dyn NativeCode>, CompileError>;

    /// Link every member into one loaded artifact.
    ///
    /// The result must resolve `entry(member.unit_id)` for each member.
    fn compact(&self, _job: &CompactJob<'_>) -> Result<Box<dyn NativeCode>, CompileError> {
        Err(CompileError::Unsupported)
    }
}

/// Cooperative cancellation flag shared with the worker
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Clear the stop flags and spawn the worker thread
pub(crate) fn start_worker(shared: &Arc<Shared>) -> io::Result<JoinHandle<()>> {
    {
        let mut cs = shared.coordinator.enter("start_worker");
        shared.stop.reset();
        cs.worker_stopped = false;
    }
    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name("jit-worker".to_string())
        .spawn(move || worker_main(&worker_shared));
    if spawned.is_err() {
        let mut cs = shared.coordinator.enter("start_worker failed");
        cs.worker_stopped = true;
        cs.worker_phase = WorkerPhase::Stopped;
    }
    spawned
}

/// Request a stop and block until the worker acknowledges it.
///
/// Re-broadcasts the wakeup every poll interval in case the worker was
/// between checkpoints when the first signal went out.
pub(crate) fn stop_worker(shared: &Shared, handle: Option<JoinHandle<()>>) {
    shared.stop.request();
    loop {
        let cs = shared.coordinator.enter("stop_worker");
        if cs.worker_stopped {
            break;
        }
        tracing::trace!("sending cancel signal to worker");
        cs.broadcast(Signal::WorkerWakeup);
        drop(cs);
        thread::sleep(shared.options.poll_interval);
    }
    if let Some(handle) = handle {
        if let Err(payload) = handle.join() {
            tracing::error!(
                panic = ?payload.downcast_ref::<&str>(),
                "JIT worker thread panicked"
            );
        }
    }
}

/// Marks the worker stopped on every exit path, unwinding included
struct StoppedGuard<'a> {
    shared: &'a Shared,
}

impl Drop for StoppedGuard<'_> {
    fn drop(&mut self) {
        let mut cs = self.shared.coordinator.enter_for_teardown("worker exit");
        cs.in_jit = false;
        cs.worker_stopped = true;
        cs.worker_phase = WorkerPhase::Stopped;
        cs.broadcast(Signal::ClientWakeup);
        if cs.pch_status == PchStatus::NotReady {
            cs.pch_status = PchStatus::Failed;
            cs.broadcast(Signal::PchWakeup);
        }
    }
}

fn worker_main(shared: &Shared) {
    let _stopped = StoppedGuard { shared };

    if !bootstrap(shared) {
        return;
    }

    loop {
        let mut cs = shared.coordinator.enter("worker: waiting for work");
        cs.worker_phase = WorkerPhase::Idle;
        cs.wait_while(Signal::WorkerWakeup, |s| {
            s.units.list(ListKind::Pending).is_empty() && !shared.stop.is_requested()
        });
        if shared.stop.is_requested() {
            cs.worker_phase = WorkerPhase::Draining;
            break;
        }

        cs.wait_while(Signal::GcWakeup, |s| s.in_gc && !shared.stop.is_requested());
        if shared.stop.is_requested() {
            cs.worker_phase = WorkerPhase::Draining;
            break;
        }

        let Some(handle) = cs.units.pop_front(ListKind::Pending) else {
            continue;
        };
        let Some((unit_id, method)) = cs
            .units
            .get(handle)
            .and_then(|unit| unit.method().map(|m| (unit.id(), m)))
        else {
            cs.units.free(handle);
            continue;
        };

        cs.in_jit = true;
        cs.worker_phase = WorkerPhase::Compiling;
        drop(cs);

        let job = CompileJob {
            unit_id,
            method: &method,
            pch_path: &shared.pch_path,
            scratch: &shared.scratch,
            class_serials: &shared.class_serials,
        };
        let result = shared.compiler.compile(&job);

        let mut cs = shared.coordinator.enter("worker: finishing unit");
        cs.in_jit = false;
        cs.broadcast(Signal::ClientWakeup);
        finish_unit(&mut cs, handle, &method, result);
        maybe_compact(shared, cs);
    }
}

/// Build the precompiled header if nobody has yet.
///
/// Returns false if compilation is impossible for this process.
fn bootstrap(shared: &Shared) -> bool {
    {
        let mut cs = shared.coordinator.enter("worker: bootstrap status");
        match cs.pch_status {
            PchStatus::Success => return true,
            PchStatus::Failed => return false,
            PchStatus::NotReady => cs.worker_phase = WorkerPhase::Bootstrapping,
        }
    }

    let job = HeaderJob {
        header_path: shared.options.header_path.as_deref(),
        pch_path: &shared.pch_path,
        scratch: &shared.scratch,
    };
    let built = panic::catch_unwind(AssertUnwindSafe(|| shared.compiler.build_header(&job)));
    let status = match built {
        Ok(Ok(())) => {
            tracing::debug!(pch = %shared.pch_path.display(), "precompiled header ready");
            PchStatus::Success
        }
        Ok(Err(err)) => {
            tracing::info!(%err, "failed to build precompiled header");
            PchStatus::Failed
        }
        Err(_) => {
            tracing::error!("compiler panicked while building precompiled header");
            PchStatus::Failed
        }
    };

    let mut cs = shared.coordinator.enter("worker: bootstrap finished");
    cs.pch_status = status;
    cs.broadcast(Signal::PchWakeup);
    if status == PchStatus::Failed {
        let abandoned = cs.units.free_list(ListKind::Pending);
        if abandoned > 0 {
            tracing::debug!(abandoned, "abandoning pending units");
        }
        return false;
    }
    true
}

/// Promote a compiled unit to the active list or release it
fn finish_unit(
    cs: &mut CriticalSection<'_>,
    handle: UnitHandle,
    method: &Arc<MethodBody>,
    result: Result<Box<dyn NativeCode>, CompileError>,
) {
    let still_wanted = cs.units.get(handle).is_some_and(|u| !u.method_collected())
        && method.routine() == RoutineState::NotReady;

    match result {
        Ok(code) if still_wanted => {
            let Some(unit_id) = cs.units.get(handle).map(|u| u.id()) else {
                return;
            };
            let Some(routine) = code.entry(unit_id) else {
                tracing::debug!(unit_id = %unit_id, "compiled code has no entry point");
                cs.counters.failed += 1;
                cs.units.free(handle);
                return;
            };
            if let Some(unit) = cs.units.get_mut(handle) {
                unit.attach_code(code);
            }
            cs.units.push_back(ListKind::Active, handle);
            method.routine_slot().store(RoutineState::Ready(routine));
            cs.counters.compiled += 1;
            cs.promoted_since_compaction += 1;
            tracing::debug!(unit_id = %unit_id, method = method.name(), "unit compiled");
        }
        Ok(_discarded) => {
            tracing::trace!(method = method.name(), "discarding code nobody waits for");
            cs.units.free(handle);
        }
        Err(err) => {
            tracing::debug!(method = method.name(), %err, "failed to compile unit");
            cs.counters.failed += 1;
            cs.units.free(handle);
        }
    }
}

/// Combine every active unit into one artifact once the queue drains at
/// the ceiling. Consumes the critical section; the compiler runs unlocked.
fn maybe_compact(shared: &Shared, mut cs: CriticalSection<'_>) {
    let due = cs.units.list(ListKind::Pending).is_empty()
        && cs.units.len(ListKind::Active) >= shared.options.max_cache_size
        && cs.promoted_since_compaction > 0;
    if !due || shared.stop.is_requested() {
        return;
    }
    cs.promoted_since_compaction = 0;

    cs.wait_while(Signal::GcWakeup, |s| s.in_gc && !shared.stop.is_requested());
    if shared.stop.is_requested() {
        return;
    }

    let members: Vec<CompactMember> = cs
        .units
        .iter(ListKind::Active)
        .filter_map(|h| cs.units.get(h))
        .filter_map(|unit| {
            unit.method().map(|method| CompactMember {
                unit_id: unit.id(),
                method,
            })
        })
        .collect();
    if members.len() < 2 {
        return;
    }
    cs.in_jit = true;
    cs.worker_phase = WorkerPhase::Compiling;
    drop(cs);

    let job = CompactJob {
        members: &members,
        pch_path: &shared.pch_path,
        scratch: &shared.scratch,
        class_serials: &shared.class_serials,
    };
    let result = shared.compiler.compact(&job);

    let mut cs = shared.coordinator.enter("worker: finishing compaction");
    cs.in_jit = false;
    cs.broadcast(Signal::ClientWakeup);
    let code = match result {
        Ok(code) => code,
        Err(CompileError::Unsupported) => return,
        Err(err) => {
            tracing::debug!(%err, "failed to compact JIT code");
            return;
        }
    };

    let mut rebound = 0;
    for member in &members {
        let Some(handle) = cs.units.unit_for_method(member.method.id()) else {
            continue;
        };
        if cs.units.list_of(handle) != Some(ListKind::Active) {
            continue;
        }
        if let Some(routine) = code.entry(member.unit_id) {
            member.method.routine_slot().store(RoutineState::Ready(routine));
            rebound += 1;
        }
    }
    let compacted = cs.units.create_detached(code);
    cs.units.push_back(ListKind::Retired, compacted);
    cs.counters.compactions += 1;
    tracing::info!(units = rebound, "compacted JIT code");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_token() {
        let token = StopToken::new();
        let shared_view = token.clone();
        assert!(!shared_view.is_requested());
        token.request();
        assert!(shared_view.is_requested());
        token.reset();
        assert!(!shared_view.is_requested());
    }
}
