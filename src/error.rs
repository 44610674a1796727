//! Error types for the jitplane engine

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by explicit engine operations.
///
/// Most hooks never return an error: environmental failures disable the
/// engine and later calls become no-ops. Only operator actions that are
/// expected to succeed (pause, resume) and initialization report here.
#[derive(Error, Debug)]
pub enum Error {
    /// Pause or resume was requested while the engine is disabled
    #[error("JIT engine is not enabled")]
    NotEnabled,

    /// The worker thread could not be restarted by `resume`
    #[error("failed to resume JIT worker")]
    ResumeFailed,

    /// The background worker thread could not be spawned
    #[error("failed to spawn JIT worker thread: {source}")]
    WorkerSpawn {
        #[source]
        source: io::Error,
    },

    /// The configured header file cannot be opened
    #[error("cannot access header file: {}", path.display())]
    HeaderInaccessible { path: PathBuf },

    #[error("IOError: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Options could not be loaded or are inconsistent
    #[error("ConfigError: {0}")]
    Config(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Failure reported by the external compiler collaborator.
///
/// These never propagate past the worker: a failed unit is recorded as
/// "not compiled" and its method keeps running interpreted.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("compilation failed: {0}")]
    Failed(String),

    /// The compiler does not implement the requested operation
    #[error("operation not supported by this compiler")]
    Unsupported,

    #[error("compiler IO error: {0}")]
    Io(#[from] io::Error),
}
