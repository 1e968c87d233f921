//! Spawning worker processes.
//!
//! The pool does not know how a worker comes to exist; it asks a
//! [`Launcher`] for a connected [`Endpoint`]. [`ProcessLauncher`] is the
//! OS implementation: it starts the worker binary with stdio wired as the
//! IPC pipe.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::process::Endpoint;
use crate::process::child::{ChildHandle, IPC_ENV};

/// Environment variable selecting the role of a spawned process.
pub const ROLE_ENV: &str = "CONDUIT_ROLE";

/// Value of [`ROLE_ENV`] for worker processes.
pub const WORKER_ROLE: &str = "worker";

/// Environment variable carrying the spawn ordinal of a worker.
pub const WORKER_ID_ENV: &str = "CONDUIT_WORKER_ID";

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "CONDUIT_WORKER_PATH";

/// Creates connected endpoints for new workers.
pub trait Launcher: Send + Sync + 'static {
    /// Start a worker. `ordinal` counts spawns within one pool.
    ///
    /// Called from within a tokio runtime.
    fn launch(&self, ordinal: u64) -> Result<Endpoint>;
}

/// Whether the current process was started as a worker.
pub fn is_worker_process() -> bool {
    std::env::var(ROLE_ENV).is_ok_and(|role| role == WORKER_ROLE)
}

/// Launches a worker executable with piped stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append an argument passed to every worker.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every worker.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, ordinal: u64) -> Result<Endpoint> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(ROLE_ENV, WORKER_ROLE)
            .env(IPC_ENV, "1")
            .env(WORKER_ID_ENV, ordinal.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Process(format!(
                    "Failed to spawn worker process '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        tracing::info!(
            ordinal,
            pid = ?child.id(),
            program = %self.program.display(),
            "Spawned worker process"
        );
        ChildHandle::from_child(child)
    }
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "conduit-worker.exe"
    } else {
        "conduit-worker"
    }
}

/// Find the conduit-worker binary.
///
/// Looks in the following order:
/// 1. `CONDUIT_WORKER_PATH` environment variable
/// 2. Same directory as the current executable (and its parent, for test
///    binaries under `deps/`)
/// 3. System PATH
/// 4. The workspace `target/debug` and `target/release` directories
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{} points to a missing file", WORKER_PATH_ENV);
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for dir in std::iter::once(exe_dir).chain(exe_dir.parent()) {
            let candidate = dir.join(binary_name());
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(binary_name()) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(binary_name());
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Config(format!(
        "could not find the conduit-worker binary; set {} or ensure it is in PATH",
        WORKER_PATH_ENV
    )))
}
