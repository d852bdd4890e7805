//! Handle to the interception engine process.
//!
//! The supervisor and the engine are separate OS processes with no shared
//! memory; this handle is the only coupling between them. Control is limited
//! to spawn, signal, kill, and the externally observable port probe.

use std::process::{Child, Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EngineConfig;

/// Errors from engine process control.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The engine binary could not be located.
    #[error("Failed to locate own executable: {0}")]
    Executable(std::io::Error),

    /// Spawning the engine failed.
    #[error("Failed to spawn engine process: {0}")]
    SpawnFailed(std::io::Error),

    /// Signaling the engine failed.
    #[error("Failed to signal engine process: {0}")]
    SignalFailed(#[from] nix::Error),

    /// Waiting on the engine failed.
    #[error("Failed to wait for engine process: {0}")]
    WaitFailed(std::io::Error),
}

/// A spawned interception engine process.
pub struct EngineProcess {
    child: Child,
    /// PID of the engine process.
    pub pid: u32,
}

impl EngineProcess {
    /// Spawn the engine by re-executing this binary with the hidden
    /// `internal-engine` subcommand, passing configuration via environment.
    pub fn spawn(config: &EngineConfig) -> Result<Self, ProcessError> {
        let exe = std::env::current_exe().map_err(ProcessError::Executable)?;

        let mut command = Command::new(exe);
        command.arg("internal-engine").stdin(Stdio::null());
        for (key, value) in config.to_env() {
            command.env(key, value);
        }

        let child = command.spawn().map_err(ProcessError::SpawnFailed)?;
        let pid = child.id();

        info!("Spawned interception engine (pid {})", pid);
        Ok(Self { child, pid })
    }

    /// Send a signal to the engine process.
    #[cfg(unix)]
    pub fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        debug!("Sending {:?} to engine (pid {})", signal, self.pid);
        kill(Pid::from_raw(self.pid as i32), signal)?;
        Ok(())
    }

    /// Force-kill the engine (SIGKILL).
    pub fn kill(&mut self) -> Result<(), ProcessError> {
        self.child.kill().map_err(ProcessError::SpawnFailed)
    }

    /// Check if the engine is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Get the exit status if available without blocking.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        self.child.try_wait().map_err(ProcessError::WaitFailed)
    }

    /// Block until the engine exits.
    pub fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        self.child.wait().map_err(ProcessError::WaitFailed)
    }
}
