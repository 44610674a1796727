//! Synchronous wait for a compiled routine
//!
//! Call sites in `wait` mode, and explicit "wait for JIT" requests, block
//! here until the worker attaches a routine. The wait is bounded: once the
//! timeout passes or the bootstrap has failed the method is given up on
//! for good, so a dead or stalled worker never hangs the caller.

use crate::method::{MethodBody, RoutineState};
use crate::options::EngineOptions;
use crate::sync::{Coordinator, PchStatus, Signal};
use crate::unit::ListKind;
use std::thread;
use std::time::Instant;

/// Poll `method`'s routine slot until it leaves `NotReady`.
///
/// Each round re-signals the worker and sleeps one poll interval outside
/// the mutex. Returns the final state, which is `NotCompiled` on give-up.
pub fn wait_for_routine(
    coordinator: &Coordinator,
    options: &EngineOptions,
    method: &MethodBody,
) -> RoutineState {
    let started = Instant::now();
    loop {
        let state = method.routine();
        if state != RoutineState::NotReady {
            return state;
        }

        let mut cs = coordinator.enter("wait_for_routine");
        let pch_failed = cs.pch_status == PchStatus::Failed;
        if pch_failed || started.elapsed() >= options.wait_timeout {
            if method.routine() == RoutineState::NotReady {
                // A queued unit is dropped here; one being compiled is
                // discarded by the worker when it sees the slot changed.
                let queued = cs
                    .units
                    .unit_for_method(method.id())
                    .filter(|h| cs.units.list_of(*h) == Some(ListKind::Pending));
                if let Some(handle) = queued {
                    cs.units.unlink(handle);
                    cs.units.free(handle);
                }
                method.routine_slot().store(RoutineState::NotCompiled);
            }
            drop(cs);
            if options.warnings_enabled() {
                tracing::warn!(
                    method = method.name(),
                    pch_failed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "timed out to wait for JIT finish"
                );
            }
            return method.routine();
        }

        cs.broadcast(Signal::WorkerWakeup);
        drop(cs);
        thread::sleep(options.poll_interval);
    }
}
