//! jitplane CLI
//!
//! Drives the engine with a synthetic compiler and workload, for watching
//! eviction, compaction and GC interplay without a real runtime attached.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jitplane::prelude::*;
use jitplane::scratch::ScratchDir;
use jitplane::VERSION;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "jitplane")]
#[command(author, version, about = "Control plane of a background method JIT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine options as JSON
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload and print engine statistics
    Simulate {
        /// Number of distinct methods
        #[arg(long, default_value_t = 200)]
        methods: usize,
        /// Number of method calls to make
        #[arg(long, default_value_t = 20_000)]
        calls: usize,
        /// Override the eviction ceiling
        #[arg(long)]
        max_cache_size: Option<usize>,
        /// Simulated compile time per unit, in milliseconds
        #[arg(long, default_value_t = 0)]
        compile_delay_ms: u64,
        /// Probability that a unit fails to compile
        #[arg(long, default_value_t = 0.05)]
        failure_rate: f64,
        /// Run a collection every this many calls (0 disables)
        #[arg(long, default_value_t = 1000)]
        gc_every: usize,
        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Print the scratch directory the engine would use
    ScratchDir,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut options = match &cli.config {
        Some(path) => EngineOptions::from_json_file(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => EngineOptions::default(),
    };
    options.verbose = options.verbose.max(cli.verbose);

    match cli.command {
        Commands::Simulate {
            methods,
            calls,
            max_cache_size,
            compile_delay_ms,
            failure_rate,
            gc_every,
            seed,
        } => {
            if let Some(size) = max_cache_size {
                options.max_cache_size = size;
            }
            let workload = Workload {
                methods: methods.max(1),
                calls,
                gc_every,
                seed,
            };
            let compiler = SyntheticCompiler {
                delay: Duration::from_millis(compile_delay_ms),
                failure_rate: failure_rate.clamp(0.0, 1.0),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            };
            simulate(options, compiler, workload)
        }
        Commands::ScratchDir => {
            println!("{}", ScratchDir::resolve().path().display());
            Ok(())
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

struct Workload {
    methods: usize,
    calls: usize,
    gc_every: usize,
    seed: u64,
}

/// Pretends to compile; every unit gets a distinct fake address
struct SyntheticCompiler {
    delay: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

struct SyntheticCode {
    entries: FxHashMap<UnitId, NativeRoutine>,
}

impl NativeCode for SyntheticCode {
    fn entry(&self, unit: UnitId) -> Option<NativeRoutine> {
        self.entries.get(&unit).copied()
    }
}

fn fake_address(unit: UnitId, base: usize) -> Option<NativeRoutine> {
    NativeRoutine::new(base + (unit.0 as usize) * 0x40)
}

impl Compiler for SyntheticCompiler {
    fn build_header(&self, job: &HeaderJob<'_>) -> std::result::Result<(), CompileError> {
        std::fs::write(job.pch_path, b"synthetic precompiled header")?;
        Ok(())
    }

    fn compile(&self, job: &CompileJob<'_>) -> std::result::Result<Box<dyn NativeCode>, CompileError> {
        std::thread::sleep(self.delay);
        let failed = self
            .rng
            .lock()
            .map(|mut rng| rng.gen_bool(self.failure_rate))
            .unwrap_or(false);
        if failed {
            return Err(CompileError::Failed(format!(
                "synthetic failure for {}",
                job.method.name()
            )));
        }
        let entries = fake_address(job.unit_id, 0x10_0000)
            .map(|routine| (job.unit_id, routine))
            .into_iter()
            .collect();
        Ok(Box::new(SyntheticCode { entries }))
    }

    fn compact(&self, job: &CompactJob<'_>) -> std::result::Result<Box<dyn NativeCode>, CompileError> {
        std::thread::sleep(self.delay * job.members.len() as u32 / 4);
        let entries = job
            .members
            .iter()
            .filter_map(|m| fake_address(m.unit_id, 0x800_0000).map(|r| (m.unit_id, r)))
            .collect();
        Ok(Box::new(SyntheticCode { entries }))
    }
}

/// The single simulated thread and the methods on its stack
#[derive(Default)]
struct SyntheticHost {
    stack: Arc<Mutex<Vec<MethodId>>>,
}

struct StackSnapshot(Vec<MethodId>);

impl ExecutionContext for StackSnapshot {
    fn for_each_frame(&self, f: &mut dyn FnMut(MethodId)) {
        self.0.iter().copied().for_each(f);
    }
}

impl Host for SyntheticHost {
    fn living_contexts(&self) -> Vec<Arc<dyn ExecutionContext>> {
        let frames = self.stack.lock().map(|s| s.clone()).unwrap_or_default();
        vec![Arc::new(StackSnapshot(frames))]
    }

    fn initial_class_serials(&self) -> Vec<ClassSerial> {
        (1..=16).collect()
    }
}

fn simulate(options: EngineOptions, compiler: SyntheticCompiler, workload: Workload) -> Result<()> {
    let host = Arc::new(SyntheticHost::default());
    let stack = Arc::clone(&host.stack);
    let engine = Engine::builder(Arc::new(compiler), host)
        .options(options)
        .try_init()
        .context("starting JIT engine")?;
    tracing::info!(version = VERSION, pch = %engine.pch_path().display(), "simulation started");

    let mut rng = StdRng::seed_from_u64(workload.seed);
    let mut next_id = 0u64;
    let mut new_method = |rng: &mut StdRng| {
        next_id += 1;
        let method = Arc::new(MethodBody::new(MethodId(next_id), format!("method_{next_id}")));
        method.set_total_calls(rng.gen_range(0..4));
        method
    };
    let mut methods: Vec<Arc<MethodBody>> = (0..workload.methods).map(|_| new_method(&mut rng)).collect();

    let started = Instant::now();
    let mut native_calls = 0usize;
    let mut marked = 0usize;
    for call in 1..=workload.calls {
        // Skewed so a few methods get most of the calls
        let skew: f64 = rng.gen::<f64>().powi(3);
        let index = ((skew * methods.len() as f64) as usize).min(methods.len() - 1);
        let method = Arc::clone(&methods[index]);

        if let Ok(mut frames) = stack.lock() {
            frames.push(method.id());
        }
        if engine.on_method_call(&method).is_some() {
            native_calls += 1;
        }
        if let Ok(mut frames) = stack.lock() {
            frames.pop();
        }

        if workload.gc_every > 0 && call % workload.gc_every == 0 {
            engine.gc_start_hook();
            engine.mark(&mut |_| marked += 1);
            // Collect one of the coldest methods
            let victim = methods.len() - 1 - rng.gen_range(0..methods.len().min(8));
            let collected = std::mem::replace(&mut methods[victim], new_method(&mut rng));
            engine.method_collected(collected.id());
            drop(collected);
            engine.gc_finish_hook();
        }
    }

    engine.pause(true).context("draining JIT queue")?;
    let stats = engine.stats();
    let report = serde_json::json!({
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "calls": workload.calls,
        "native_calls": native_calls,
        "marked": marked,
        "engine": stats,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.shutdown();
    Ok(())
}
