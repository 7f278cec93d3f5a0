//! Duplicate-instance guard backed by a PID file.

use nix::{sys::signal::kill, unistd::Pid};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::error::PidFileError;

/// Holds the PID file for the lifetime of the process and removes it on a
/// clean shutdown.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Removes the PID file. Also called from `Drop`.
    pub fn release(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove PID file {}: {err}", self.path.display());
        }
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Refuses to start when the recorded PID still names a live process, then
/// records our own PID.
pub fn acquire(path: &Path) -> Result<PidFileGuard, PidFileError> {
    if let Ok(raw) = fs::read_to_string(path) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            debug!("ignoring empty PID file {}", path.display());
        } else {
            let pid: i32 = trimmed
                .parse()
                .map_err(|_| PidFileError::Malformed(trimmed.to_string()))?;
            if process_alive(pid) {
                return Err(PidFileError::AlreadyRunning(pid));
            }
            debug!("replacing stale PID file for dead process {pid}");
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(PidFileGuard {
        path: path.to_path_buf(),
    })
}

/// Probes for a live process with a null signal.
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}
