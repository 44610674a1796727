//! The JIT engine context
//!
//! [`Engine`] is the one object the host runtime talks to. It owns the
//! coordination state, the worker thread, the validity set and the scratch
//! paths, and exposes every inbound hook: enqueue, GC bracketing and
//! marking, method collection, class definition events, continuations,
//! fork, pause/resume and shutdown.
//!
//! Environmental failures never reach the host as errors from the hooks.
//! They disable the engine, after which every hook is a no-op and methods
//! keep running interpreted. Only `pause`, `resume` and the fallible
//! constructor report errors.

use crate::continuation::{ContinuationHandle, ExecutionContext};
use crate::error::{Error, Result};
use crate::eviction::{self, EvictionReport};
use crate::method::{MethodBody, MethodId, NativeRoutine, RoutineState};
use crate::options::EngineOptions;
use crate::scratch::{ScratchDir, ARTIFACT_PREFIX};
use crate::sync::{Coordinator, Counters, EngineState, PchStatus, Signal, WorkerPhase};
use crate::unit::ListKind;
use crate::validity::{ClassSerial, ClassSerialSet};
use crate::wait;
use crate::worker::{self, Compiler, StopToken};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// The embedding runtime, as seen by the engine
pub trait Host: Send + Sync {
    /// One context per running thread, for stack scans
    fn living_contexts(&self) -> Vec<Arc<dyn ExecutionContext>>;

    /// Serials of the classes and modules defined before the engine starts
    fn initial_class_serials(&self) -> Vec<ClassSerial> {
        Vec::new()
    }
}

/// State shared between the engine handle and its worker thread
pub(crate) struct Shared {
    pub(crate) coordinator: Coordinator,
    pub(crate) compiler: Arc<dyn Compiler>,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) class_serials: ClassSerialSet,
    pub(crate) scratch: ScratchDir,
    pub(crate) pch_path: PathBuf,
    pub(crate) options: EngineOptions,
    pub(crate) stop: StopToken,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub enabled: bool,
    pub call_enabled: bool,
    pub pending: usize,
    pub active: usize,
    pub retired: usize,
    pub continuations: usize,
    pub class_serials: usize,
    pub pch_status: PchStatus,
    pub worker_phase: WorkerPhase,
    pub counters: Counters,
}

/// Configures and starts an [`Engine`]
pub struct EngineBuilder {
    options: EngineOptions,
    scratch: Option<ScratchDir>,
    compiler: Arc<dyn Compiler>,
    host: Arc<dyn Host>,
}

impl EngineBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `scratch` instead of resolving one from the environment
    pub fn scratch_dir(mut self, scratch: ScratchDir) -> Self {
        self.scratch = Some(scratch);
        self
    }

    /// Start the engine, leaving it disabled if anything fails
    pub fn init(self) -> Engine {
        let engine = self.build();
        if let Err(err) = engine.boot() {
            tracing::info!(%err, "JIT disabled");
        }
        engine
    }

    /// Start the engine, reporting why it could not be enabled
    pub fn try_init(self) -> Result<Engine> {
        let engine = self.build();
        engine.boot()?;
        Ok(engine)
    }

    fn build(self) -> Engine {
        let options = self.options.normalized();
        let scratch = self.scratch.unwrap_or_else(ScratchDir::resolve);
        let pch_path = scratch.unique_path(0, &format!("{ARTIFACT_PREFIX}h"), ".h.gch");
        Engine {
            shared: Arc::new(Shared {
                coordinator: Coordinator::new(),
                compiler: self.compiler,
                host: self.host,
                class_serials: ClassSerialSet::new(),
                scratch,
                pch_path,
                options,
                stop: StopToken::new(),
            }),
            enabled: AtomicBool::new(false),
            call_p: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }
}

/// The JIT control plane of one process
pub struct Engine {
    shared: Arc<Shared>,
    enabled: AtomicBool,
    /// Whether call sites may enter JIT-ed code
    call_p: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(compiler: Arc<dyn Compiler>, host: Arc<dyn Host>) -> EngineBuilder {
        EngineBuilder {
            options: EngineOptions::default(),
            scratch: None,
            compiler,
            host,
        }
    }

    /// Start an engine with `options`; disabled on failure
    pub fn init(options: EngineOptions, compiler: Arc<dyn Compiler>, host: Arc<dyn Host>) -> Self {
        Self::builder(compiler, host).options(options).init()
    }

    fn boot(&self) -> Result<()> {
        let shared = &self.shared;
        if let Some(header) = &shared.options.header_path {
            if let Err(err) = File::open(header) {
                tracing::debug!(path = %header.display(), %err, "cannot access header file");
                return Err(Error::HeaderInaccessible {
                    path: header.clone(),
                });
            }
        }

        for serial in shared.host.initial_class_serials() {
            shared.class_serials.add(serial);
        }

        self.enabled.store(true, Ordering::SeqCst);
        self.call_p.store(true, Ordering::SeqCst);
        match worker::start_worker(shared) {
            Ok(handle) => self.set_worker(Some(handle)),
            Err(source) => {
                self.disable();
                return Err(Error::WorkerSpawn { source });
            }
        }

        tracing::info!(
            scratch = %shared.scratch.path().display(),
            max_cache_size = shared.options.max_cache_size,
            min_calls = shared.options.min_calls,
            "JIT engine initialized"
        );
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.call_p.store(false, Ordering::SeqCst);
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_worker(&self, handle: Option<JoinHandle<()>>) {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn call_enabled(&self) -> bool {
        self.call_p.load(Ordering::SeqCst)
    }

    /// Allow or forbid entering JIT-ed code, e.g. while tracing is active
    pub fn set_call_enabled(&self, enabled: bool) {
        if self.is_enabled() {
            self.call_p.store(enabled, Ordering::SeqCst);
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    pub fn scratch_dir(&self) -> &ScratchDir {
        &self.shared.scratch
    }

    /// Where the precompiled header is built
    pub fn pch_path(&self) -> &Path {
        &self.shared.pch_path
    }

    pub fn bootstrap_status(&self) -> PchStatus {
        self.shared.coordinator.enter("bootstrap_status").pch_status
    }

    /// Block until the bootstrap has finished or the worker is gone
    pub fn wait_for_bootstrap(&self) -> PchStatus {
        let mut cs = self.shared.coordinator.enter("wait_for_bootstrap");
        cs.wait_while(Signal::PchWakeup, |s| {
            s.pch_status == PchStatus::NotReady && !s.worker_stopped
        });
        cs.pch_status
    }

    /// Queue `method` for compilation.
    ///
    /// Returns false if the engine is disabled, the bootstrap failed, or
    /// the method was already queued or given up on.
    pub fn enqueue(&self, method: &Arc<MethodBody>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut cs = self.shared.coordinator.enter("enqueue");
        if cs.pch_status == PchStatus::Failed {
            return false;
        }
        if !method.routine_slot().claim() {
            return false;
        }

        let handle = cs.units.create(method);
        cs.units.push_back(ListKind::Pending, handle);
        cs.counters.enqueued += 1;
        if cs.units.len(ListKind::Active) >= self.shared.options.max_cache_size {
            self.unload_units(&mut cs);
        }
        tracing::trace!(method = method.name(), "sending wakeup signal to worker");
        cs.broadcast(Signal::WorkerWakeup);
        true
    }

    /// Eviction pass over the active list; the caller holds the mutex
    fn unload_units(&self, state: &mut EngineState) -> EvictionReport {
        let threads = self.shared.host.living_contexts();
        let EngineState {
            units,
            continuations,
            counters,
            ..
        } = state;
        let contexts = threads
            .iter()
            .chain(continuations.iter())
            .map(|c| &**c as &dyn ExecutionContext);
        let report = eviction::unload_units(units, self.shared.options.max_cache_size, contexts);
        counters.unloaded += report.unloaded as u64;
        counters.collected += report.collected as u64;
        report
    }

    /// Call-site dispatch.
    ///
    /// Counts the call, queues the method once it is hot, and returns the
    /// routine to jump to if native code is attached.
    pub fn on_method_call(&self, method: &Arc<MethodBody>) -> Option<NativeRoutine> {
        if !self.call_enabled() {
            return None;
        }
        let calls = method.record_call();
        let mut state = method.routine();
        if state == RoutineState::NotAdded && calls >= self.shared.options.min_calls {
            self.enqueue(method);
            state = if self.shared.options.wait {
                self.wait_for_routine(method)
            } else {
                method.routine()
            };
        }
        match state {
            RoutineState::Ready(routine) if self.call_enabled() => Some(routine),
            _ => None,
        }
    }

    /// Block until `method` has a routine or is given up on
    pub fn wait_for_routine(&self, method: &MethodBody) -> RoutineState {
        if !self.is_enabled() {
            return method.routine();
        }
        wait::wait_for_routine(&self.shared.coordinator, &self.shared.options, method)
    }

    /// A collection is about to start; waits out any compilation step
    pub fn gc_start_hook(&self) {
        if !self.is_enabled() {
            return;
        }
        let mut cs = self.shared.coordinator.enter("gc_start_hook");
        cs.wait_while(Signal::ClientWakeup, |s| s.in_jit);
        cs.in_gc = true;
    }

    /// The collection finished; lets the worker continue
    pub fn gc_finish_hook(&self) {
        if !self.is_enabled() {
            return;
        }
        let mut cs = self.shared.coordinator.enter("gc_finish_hook");
        cs.in_gc = false;
        tracing::trace!("sending wakeup signal to worker after GC");
        cs.broadcast(Signal::GcWakeup);
    }

    /// The collector reclaimed a method body. Its unit stays where it is.
    pub fn method_collected(&self, method: MethodId) {
        if !self.is_enabled() {
            return;
        }
        let mut cs = self.shared.coordinator.enter("method_collected");
        cs.units.detach_method(method);
    }

    /// GC mark phase: hand every method body that still has a unit worth
    /// keeping to `visitor`.
    ///
    /// That is every pending unit, and every active unit on a live stack or
    /// registered continuation. `visitor` runs without the mutex held since
    /// marking may trigger a nested collection.
    pub fn mark(&self, visitor: &mut dyn FnMut(&Arc<MethodBody>)) {
        if !self.is_enabled() {
            return;
        }
        let threads = self.shared.host.living_contexts();
        let reachable = {
            let cs = self.shared.coordinator.enter("mark");
            let mut reachable: Vec<Arc<MethodBody>> = cs
                .units
                .iter(ListKind::Pending)
                .filter_map(|h| cs.units.get(h).and_then(|u| u.method()))
                .collect();
            let mut on_stack = |method_id: MethodId| {
                let Some(handle) = cs.units.unit_for_method(method_id) else {
                    return;
                };
                if cs.units.list_of(handle) != Some(ListKind::Active) {
                    return;
                }
                if let Some(method) = cs.units.get(handle).and_then(|u| u.method()) {
                    reachable.push(method);
                }
            };
            for context in threads.iter().chain(cs.continuations.iter()) {
                context.for_each_frame(&mut on_stack);
            }
            reachable
        };
        for method in &reachable {
            visitor(method);
        }
    }

    /// A class or module definition became current
    pub fn add_class_serial(&self, serial: ClassSerial) {
        if !self.is_enabled() {
            return;
        }
        self.shared.class_serials.add(serial);
    }

    /// A class or module definition was invalidated
    pub fn remove_class_serial(&self, serial: ClassSerial) {
        if !self.is_enabled() {
            return;
        }
        let _cs = self.shared.coordinator.enter("remove_class_serial");
        self.shared.class_serials.remove(serial);
    }

    pub fn class_serials(&self) -> &ClassSerialSet {
        &self.shared.class_serials
    }

    /// Register a continuation whose stack may run JIT-ed code
    pub fn cont_new(&self, context: Arc<dyn ExecutionContext>) -> Option<ContinuationHandle> {
        if !self.is_enabled() {
            return None;
        }
        let mut cs = self.shared.coordinator.enter("cont_new");
        Some(cs.continuations.register(context))
    }

    pub fn cont_free(&self, handle: ContinuationHandle) -> bool {
        let mut cs = self.shared.coordinator.enter("cont_free");
        cs.continuations.unregister(handle)
    }

    /// Called in the child after `fork`; the worker thread did not survive
    pub fn child_after_fork(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            tracing::debug!("switching off JIT in a forked child");
        }
    }

    /// Stop the worker.
    ///
    /// With `wait`, first lets the worker drain the pending list. Returns
    /// false if the worker was already stopped.
    pub fn pause(&self, wait: bool) -> Result<bool> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }
        if self.shared.coordinator.enter("pause").worker_stopped {
            return Ok(false);
        }

        if wait {
            loop {
                let cs = self.shared.coordinator.enter("pause: draining");
                if cs.units.list(ListKind::Pending).is_empty() || cs.worker_stopped {
                    break;
                }
                cs.broadcast(Signal::WorkerWakeup);
                drop(cs);
                std::thread::sleep(self.shared.options.poll_interval);
            }
        }

        worker::stop_worker(&self.shared, self.take_worker());
        tracing::debug!("JIT worker paused");
        Ok(true)
    }

    /// Restart a paused worker. Returns false if it is already running.
    pub fn resume(&self) -> Result<bool> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }
        if !self.shared.coordinator.enter("resume").worker_stopped {
            return Ok(false);
        }
        // Reap the previous thread if it stopped on its own
        if let Some(previous) = self.take_worker() {
            let _ = previous.join();
        }
        match worker::start_worker(&self.shared) {
            Ok(handle) => {
                self.set_worker(Some(handle));
                tracing::debug!("JIT worker resumed");
                Ok(true)
            }
            Err(err) => {
                tracing::info!(%err, "failed to resume JIT worker");
                self.disable();
                Err(Error::ResumeFailed)
            }
        }
    }

    /// Tear the engine down.
    ///
    /// Waits for the bootstrap to settle, stops the worker, removes the
    /// header artifact and releases every unit and continuation. Safe to
    /// call more than once; later calls and every hook become no-ops.
    pub fn shutdown(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.call_p.store(false, Ordering::SeqCst);

        // The compiler may still be writing the header; don't pull the
        // files out from under it.
        self.wait_for_bootstrap();
        worker::stop_worker(&self.shared, self.take_worker());

        if !self.shared.options.save_temps {
            self.shared.scratch.remove_artifact(&self.shared.pch_path);
        }

        let mut cs = self.shared.coordinator.enter("shutdown");
        let released: usize = ListKind::ALL
            .iter()
            .map(|kind| cs.units.free_list(*kind))
            .sum();
        let continuations = cs.continuations.clear();
        let counters = cs.counters;
        drop(cs);

        tracing::info!(
            released,
            continuations,
            compiled = counters.compiled,
            failed = counters.failed,
            unloaded = counters.unloaded,
            "JIT engine finished"
        );
    }

    pub fn stats(&self) -> EngineStats {
        let cs = self.shared.coordinator.enter("stats");
        EngineStats {
            enabled: self.is_enabled(),
            call_enabled: self.call_enabled(),
            pending: cs.units.len(ListKind::Pending),
            active: cs.units.len(ListKind::Active),
            retired: cs.units.len(ListKind::Retired),
            continuations: cs.continuations.len(),
            class_serials: self.shared.class_serials.len(),
            pch_status: cs.pch_status,
            worker_phase: cs.worker_phase,
            counters: cs.counters,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::unit::{NativeCode, UnitId};
    use crate::worker::{CompileJob, HeaderJob};
    use std::time::Duration;

    struct Code;

    impl NativeCode for Code {
        fn entry(&self, unit: UnitId) -> Option<NativeRoutine> {
            NativeRoutine::new(0x10_000 + unit.0 as usize)
        }
    }

    struct InstantCompiler {
        header_ok: bool,
    }

    impl Compiler for InstantCompiler {
        fn build_header(&self, _job: &HeaderJob<'_>) -> std::result::Result<(), CompileError> {
            if self.header_ok {
                Ok(())
            } else {
                Err(CompileError::Failed("no compiler".to_string()))
            }
        }

        fn compile(
            &self,
            _job: &CompileJob<'_>,
        ) -> std::result::Result<Box<dyn NativeCode>, CompileError> {
            Ok(Box::new(Code))
        }
    }

    struct NoThreads;

    impl Host for NoThreads {
        fn living_contexts(&self) -> Vec<Arc<dyn ExecutionContext>> {
            Vec::new()
        }

        fn initial_class_serials(&self) -> Vec<ClassSerial> {
            vec![1, 2, 3]
        }
    }

    fn start_engine(header_ok: bool, options: EngineOptions) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::builder(Arc::new(InstantCompiler { header_ok }), Arc::new(NoThreads))
            .options(options)
            .scratch_dir(ScratchDir::at(dir.path()))
            .try_init()
            .unwrap();
        (engine, dir)
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_init_seeds_class_serials() {
        let (engine, _dir) = start_engine(true, EngineOptions::default());
        assert!(engine.is_enabled());
        assert!(engine.call_enabled());
        assert_eq!(engine.class_serials().snapshot(), vec![1, 2, 3]);
        assert_eq!(engine.wait_for_bootstrap(), PchStatus::Success);
    }

    #[test]
    fn test_pch_path_is_unique_per_process() {
        let (engine, dir) = start_engine(true, EngineOptions::default());
        let expected = format!("_jit_hp{}u0.h.gch", std::process::id());
        assert_eq!(engine.pch_path(), dir.path().join(expected));
    }

    #[test]
    fn test_missing_header_disables() {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            header_path: Some(dir.path().join("missing.h")),
            ..EngineOptions::default()
        };
        let builder = Engine::builder(
            Arc::new(InstantCompiler { header_ok: true }),
            Arc::new(NoThreads),
        )
        .options(options)
        .scratch_dir(ScratchDir::at(dir.path()));
        let engine = builder.init();
        assert!(!engine.is_enabled());
        assert!(matches!(engine.pause(false), Err(Error::NotEnabled)));
        assert!(matches!(engine.resume(), Err(Error::NotEnabled)));
    }

    #[test]
    fn test_hot_method_gets_compiled() {
        let options = EngineOptions {
            min_calls: 3,
            ..EngineOptions::default()
        };
        let (engine, _dir) = start_engine(true, options);
        let method = Arc::new(MethodBody::new(MethodId(7), "hot"));

        assert_eq!(engine.on_method_call(&method), None);
        assert_eq!(engine.on_method_call(&method), None);
        engine.on_method_call(&method);
        wait_until(|| matches!(method.routine(), RoutineState::Ready(_)));
        assert!(engine.on_method_call(&method).is_some());
        assert_eq!(engine.stats().active, 1);
    }

    #[test]
    fn test_bootstrap_failure_rejects_enqueue() {
        let (engine, _dir) = start_engine(false, EngineOptions::default());
        assert_eq!(engine.wait_for_bootstrap(), PchStatus::Failed);
        let method = Arc::new(MethodBody::new(MethodId(1), "never"));
        assert!(!engine.enqueue(&method));
        assert_eq!(method.routine(), RoutineState::NotAdded);
    }

    #[test]
    fn test_set_call_enabled_gates_dispatch() {
        let (engine, _dir) = start_engine(true, EngineOptions::default());
        engine.set_call_enabled(false);
        let method = Arc::new(MethodBody::new(MethodId(1), "traced"));
        for _ in 0..10 {
            assert_eq!(engine.on_method_call(&method), None);
        }
        assert_eq!(method.total_calls(), 0);
    }

    #[test]
    fn test_remove_class_serial() {
        let (engine, _dir) = start_engine(true, EngineOptions::default());
        engine.add_class_serial(42);
        assert!(engine.class_serials().contains(42));
        engine.remove_class_serial(42);
        assert!(!engine.class_serials().contains(42));
    }

    #[test]
    fn test_shutdown_removes_pch_unless_save_temps() {
        let (engine, _dir) = start_engine(true, EngineOptions::default());
        engine.wait_for_bootstrap();
        std::fs::write(engine.pch_path(), b"pch").unwrap();
        let pch = engine.pch_path().to_path_buf();
        engine.shutdown();
        assert!(!pch.exists());

        let options = EngineOptions {
            save_temps: true,
            ..EngineOptions::default()
        };
        let (engine, _dir) = start_engine(true, options);
        engine.wait_for_bootstrap();
        std::fs::write(engine.pch_path(), b"pch").unwrap();
        engine.shutdown();
        assert!(engine.pch_path().exists());
    }
}
