//! Scratch directory for compiler artifacts
//!
//! Resolved once at init. Candidates are tried in order: `$TMPDIR`, `$TMP`,
//! the platform default, then `/tmp` unconditionally. A candidate must be a
//! writable directory; on unix a world-writable one must also carry the
//! sticky bit, otherwise other users could swap our artifacts out.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Prefix of every artifact the engine names
pub const ARTIFACT_PREFIX: &str = "_jit_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Resolve from the process environment
    pub fn resolve() -> Self {
        Self::resolve_from(
            [std::env::var_os("TMPDIR"), std::env::var_os("TMP")],
            platform_default(),
        )
    }

    /// Resolve from explicit environment values and platform default
    pub fn resolve_from(
        env: impl IntoIterator<Item = Option<OsString>>,
        platform_default: Option<PathBuf>,
    ) -> Self {
        let candidates = env
            .into_iter()
            .flatten()
            .map(PathBuf::from)
            .chain(platform_default);
        for candidate in candidates {
            if check_dir(&candidate) {
                return Self { path: candidate };
            }
            tracing::trace!(path = %candidate.display(), "rejecting scratch candidate");
        }
        Self {
            path: PathBuf::from("/tmp"),
        }
    }

    /// Use `path` as is, without checks
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique artifact path for this process.
    ///
    /// `id` distinguishes artifacts of one process; the engine uses 0 for
    /// process-wide files and the unit id for per-unit ones.
    pub fn unique_path(&self, id: u64, prefix: &str, suffix: &str) -> PathBuf {
        self.path.join(unique_file_name(std::process::id(), id, prefix, suffix))
    }

    /// Remove an artifact, logging instead of failing
    pub fn remove_artifact(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed artifact"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %path.display(), %err, "failed to remove artifact"),
        }
    }
}

/// `{prefix}p{pid}u{id}{suffix}`
pub fn unique_file_name(pid: u32, id: u64, prefix: &str, suffix: &str) -> String {
    format!("{prefix}p{pid}u{id}{suffix}")
}

fn platform_default() -> Option<PathBuf> {
    #[cfg(windows)]
    {
        Some(std::env::temp_dir())
    }
    #[cfg(not(windows))]
    {
        None
    }
}

/// Whether `dir` is safe to write artifacts into
pub fn check_dir(dir: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(dir) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::fs::PermissionsExt;

        const S_IWOTH: u32 = 0o002;
        const S_ISVTX: u32 = 0o1000;
        let mode = meta.permissions().mode();
        if mode & S_IWOTH != 0 && mode & S_ISVTX == 0 {
            return false;
        }
        let Ok(c_path) = std::ffi::CString::new(dir.as_os_str().as_bytes()) else {
            return false;
        };
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
        if unsafe { libc::access(c_path.as_ptr(), libc::W_OK) } != 0 {
            return false;
        }
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() {
            return false;
        }
    }
    true
}
