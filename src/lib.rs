//! jitplane: the control plane of a background method JIT
//!
//! The engine sits between a managed-language runtime and a native-code
//! compiler. The runtime reports hot method bodies; a single background
//! worker compiles them; the engine keeps the number of loaded units under
//! a ceiling without ever unloading code that is executing, and keeps
//! compilation and garbage collection from overlapping.
//!
//! Code generation itself is out of scope: the host supplies a
//! [`Compiler`] and receives opaque [`NativeCode`] back.
//!
//! # Quick Start
//!
//! ```no_run
//! use jitplane::prelude::*;
//! use std::sync::Arc;
//!
//! # fn demo(compiler: Arc<dyn Compiler>, host: Arc<dyn Host>) {
//! let engine = Engine::init(EngineOptions::default(), compiler, host);
//! let method = Arc::new(MethodBody::new(MethodId(1), "Integer#times"));
//! if let Some(routine) = engine.on_method_call(&method) {
//!     println!("jump to {:#x}", routine.addr());
//! }
//! engine.shutdown();
//! # }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Entry point** | [`engine`], [`options`], [`error`](Error) |
//! | **Data** | [`method`], [`unit`], [`continuation`], [`validity`] |
//! | **Concurrency** | [`sync`], [`worker`], [`wait`] |
//! | **Policy** | [`eviction`] |
//! | **Platform** | [`scratch`] |

pub mod continuation;
pub mod engine;
pub mod eviction;
pub mod method;
pub mod options;
pub mod prelude;
pub mod scratch;
pub mod sync;
pub mod unit;
pub mod validity;
pub mod wait;
pub mod worker;

mod error;

pub use continuation::{ContinuationHandle, ExecutionContext};
pub use engine::{Engine, EngineBuilder, EngineStats, Host};
pub use error::{CompileError, Error, Result};
pub use method::{MethodBody, MethodId, NativeRoutine, RoutineState};
pub use options::EngineOptions;
pub use sync::{PchStatus, WorkerPhase};
pub use unit::{NativeCode, UnitId};
pub use validity::{ClassSerial, ClassSerialSet};
pub use worker::{CompactJob, CompactMember, CompileJob, Compiler, HeaderJob};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
