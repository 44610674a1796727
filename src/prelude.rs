//! Prelude module for convenient imports
//!
//! Everything a host needs to embed the engine:
//!
//! ```no_run
//! use jitplane::prelude::*;
//! ```

// Engine and configuration
pub use crate::engine::{Engine, EngineBuilder, EngineStats, Host};
pub use crate::options::EngineOptions;

// Error handling
pub use crate::error::{CompileError, Error, Result};

// Method bodies and routines
pub use crate::method::{MethodBody, MethodId, NativeRoutine, RoutineState};

// Compiler seam
pub use crate::unit::{NativeCode, UnitId};
pub use crate::worker::{CompactJob, CompactMember, CompileJob, Compiler, HeaderJob};

// Stack walking and invalidation
pub use crate::continuation::{ContinuationHandle, ExecutionContext};
pub use crate::validity::ClassSerial;

// Status
pub use crate::sync::{PchStatus, WorkerPhase};
