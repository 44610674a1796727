//! Shared test helpers for integration tests
#![allow(dead_code)]

use jitplane::prelude::*;
use jitplane::scratch::ScratchDir;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on
pub const PATIENCE: Duration = Duration::from_secs(10);

/// A latch that blocks callers until opened
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// Block until opened, giving up after `PATIENCE`
    pub fn pass(&self) {
        let guard = self.open.lock().unwrap();
        let _ = self
            .cond
            .wait_timeout_while(guard, PATIENCE, |open| !*open)
            .unwrap();
    }
}

/// Loaded code that counts how often it is unloaded
pub struct FakeCode {
    entries: Vec<(UnitId, NativeRoutine)>,
    unloads: Arc<AtomicUsize>,
}

impl NativeCode for FakeCode {
    fn entry(&self, unit: UnitId) -> Option<NativeRoutine> {
        self.entries
            .iter()
            .find(|(id, _)| *id == unit)
            .map(|(_, routine)| *routine)
    }
}

impl Drop for FakeCode {
    fn drop(&mut self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn unit_address(unit: UnitId) -> usize {
    0x1000 + unit.0 as usize * 0x10
}

pub fn compacted_address(unit: UnitId) -> usize {
    0x90_0000 + unit.0 as usize * 0x10
}

/// Compiler double with configurable behavior and a timeline of its work
#[derive(Default)]
pub struct FakeCompiler {
    delay: Duration,
    fail_header: bool,
    header_gate: Option<Arc<Gate>>,
    compile_gate: Option<Arc<Gate>>,
    failing: Vec<MethodId>,
    compaction: bool,
    pub started: AtomicUsize,
    pub compiled: AtomicUsize,
    pub unloads: Arc<AtomicUsize>,
    /// Start and end of every compiler invocation
    pub intervals: Mutex<Vec<(Instant, Instant)>>,
}

impl FakeCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_header(mut self) -> Self {
        self.fail_header = true;
        self
    }

    pub fn with_header_gate(mut self, gate: Arc<Gate>) -> Self {
        self.header_gate = Some(gate);
        self
    }

    pub fn with_compile_gate(mut self, gate: Arc<Gate>) -> Self {
        self.compile_gate = Some(gate);
        self
    }

    pub fn failing_method(mut self, method: MethodId) -> Self {
        self.failing.push(method);
        self
    }

    pub fn with_compaction(mut self) -> Self {
        self.compaction = true;
        self
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    fn record(&self, started: Instant) {
        self.intervals.lock().unwrap().push((started, Instant::now()));
    }

    fn code(&self, entries: Vec<(UnitId, NativeRoutine)>) -> Box<dyn NativeCode> {
        Box::new(FakeCode {
            entries,
            unloads: Arc::clone(&self.unloads),
        })
    }
}

impl Compiler for FakeCompiler {
    fn build_header(&self, _job: &HeaderJob<'_>) -> std::result::Result<(), CompileError> {
        if let Some(gate) = &self.header_gate {
            gate.pass();
        }
        if self.fail_header {
            return Err(CompileError::Failed("cc: command not found".to_string()));
        }
        Ok(())
    }

    fn compile(
        &self,
        job: &CompileJob<'_>,
    ) -> std::result::Result<Box<dyn NativeCode>, CompileError> {
        let started = Instant::now();
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.compile_gate {
            gate.pass();
        }
        std::thread::sleep(self.delay);
        self.record(started);

        if self.failing.contains(&job.method.id()) {
            return Err(CompileError::Failed(format!("{} did not compile", job.method.name())));
        }
        self.compiled.fetch_add(1, Ordering::SeqCst);
        let routine = NativeRoutine::new(unit_address(job.unit_id)).unwrap();
        Ok(self.code(vec![(job.unit_id, routine)]))
    }

    fn compact(
        &self,
        job: &CompactJob<'_>,
    ) -> std::result::Result<Box<dyn NativeCode>, CompileError> {
        if !self.compaction {
            return Err(CompileError::Unsupported);
        }
        let started = Instant::now();
        std::thread::sleep(self.delay);
        self.record(started);
        let entries = job
            .members
            .iter()
            .map(|m| (m.unit_id, NativeRoutine::new(compacted_address(m.unit_id)).unwrap()))
            .collect();
        Ok(self.code(entries))
    }
}

/// A call stack captured for one thread
pub struct Frames(pub Vec<MethodId>);

impl ExecutionContext for Frames {
    fn for_each_frame(&self, f: &mut dyn FnMut(MethodId)) {
        self.0.iter().copied().for_each(f);
    }
}

/// Host double with scripted thread stacks
#[derive(Default)]
pub struct FakeHost {
    stacks: Mutex<Vec<Vec<MethodId>>>,
    serials: Vec<ClassSerial>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serials(serials: Vec<ClassSerial>) -> Self {
        Self {
            serials,
            ..Self::default()
        }
    }

    /// Replace the stacks of every living thread
    pub fn set_stacks(&self, stacks: Vec<Vec<MethodId>>) {
        *self.stacks.lock().unwrap() = stacks;
    }
}

impl Host for FakeHost {
    fn living_contexts(&self) -> Vec<Arc<dyn ExecutionContext>> {
        self.stacks
            .lock()
            .unwrap()
            .iter()
            .map(|frames| Arc::new(Frames(frames.clone())) as Arc<dyn ExecutionContext>)
            .collect()
    }

    fn initial_class_serials(&self) -> Vec<ClassSerial> {
        self.serials.clone()
    }
}

/// An engine with its own scratch directory
pub struct Harness {
    pub engine: Engine,
    pub compiler: Arc<FakeCompiler>,
    pub host: Arc<FakeHost>,
    pub scratch: tempfile::TempDir,
}

pub fn start(compiler: FakeCompiler, options: EngineOptions) -> Harness {
    start_with_host(compiler, FakeHost::new(), options)
}

pub fn start_with_host(compiler: FakeCompiler, host: FakeHost, options: EngineOptions) -> Harness {
    let scratch = tempfile::tempdir().unwrap();
    let compiler = Arc::new(compiler);
    let host = Arc::new(host);
    let engine = Engine::builder(compiler.clone(), host.clone())
        .options(options)
        .scratch_dir(ScratchDir::at(scratch.path()))
        .try_init()
        .unwrap();
    Harness {
        engine,
        compiler,
        host,
        scratch,
    }
}

pub fn method(id: u64) -> Arc<MethodBody> {
    Arc::new(MethodBody::new(MethodId(id), format!("method_{id}")))
}

pub fn method_with_calls(id: u64, calls: u64) -> Arc<MethodBody> {
    let method = method(id);
    method.set_total_calls(calls);
    method
}

/// Poll `done` until it holds; panics after `PATIENCE`
pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let started = Instant::now();
    while !done() {
        assert!(started.elapsed() < PATIENCE, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn wait_ready(method: &MethodBody) -> NativeRoutine {
    let mut routine = None;
    wait_until(method.name(), || {
        if let RoutineState::Ready(r) = method.routine() {
            routine = Some(r);
        }
        routine.is_some()
    });
    routine.unwrap()
}

pub fn small_cache() -> EngineOptions {
    EngineOptions {
        max_cache_size: 10,
        ..EngineOptions::default()
    }
}
