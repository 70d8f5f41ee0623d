//! Workspace lock
//!
//! One `weft run` per workspace. Two loops sharing a workspace would
//! interleave status records and fight over the same agent session, so
//! a second instance fails fast instead.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::Path;

const LOCK_FILE: &str = ".weft.lock";

/// Advisory exclusive lock on `<workspace>/.weft.lock`, held for the
/// life of the run. Released on drop and, failing that, by the OS when
/// the process exits.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: std::fs::File,
}

impl WorkspaceLock {
    pub fn acquire(workspace: &Path) -> Result<Self> {
        let path = workspace.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another weft run is already active in {}. \
                 Stop it first, or use a different --workspace.",
                workspace.display()
            )
        })?;

        Ok(Self { file })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        // The lock file itself stays behind; only the lock is released
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
