//! Per-run session log
//!
//! One append-only file per `weft run` under `<workspace>/logs/`,
//! holding the full raw output of every iteration plus banners and
//! timestamped events. Every write is flushed so `tail -f` stays live.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::provider::AgentCommand;

pub struct SessionLog {
    path: PathBuf,
    file: File,
}

impl SessionLog {
    /// Create `logs/weft_<stamp>_<short-uuid>.log` in the workspace.
    /// The uuid keeps two runs started within the same second apart.
    pub fn create(workspace: &Path) -> Result<Self> {
        let log_dir = workspace.join("logs");
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create {}", log_dir.display()))?;

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let short_id = uuid::Uuid::new_v4()
            .to_string()
            .split('-')
            .next()
            .unwrap_or("")
            .to_string();
        let path = log_dir.join(format!("weft_{stamp}_{short_id}.log"));

        let file = File::create(&path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;

        let mut log = Self { path, file };
        let banner = format!("session started - log: {}", log.path.display());
        log.event(&banner)?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn iteration_start(&mut self, iteration: u32, command: &AgentCommand) -> Result<()> {
        let rule = "=".repeat(60);
        self.write_line(&format!("\n{rule}"))?;
        self.write_line(&format!("ITERATION {iteration}"))?;
        self.write_line(&format!("cmd: {}", command.display_line()))?;
        self.write_line(&format!("started: {}", Local::now().to_rfc3339()))?;
        self.write_line(&format!("{rule}\n"))?;
        Ok(())
    }

    /// Streamed child output. Called from the runner's output callback,
    /// which cannot carry a Result; a failing disk surfaces on the next
    /// banner or event write instead.
    pub fn raw_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{line}");
        let _ = self.file.flush();
    }

    pub fn iteration_end(&mut self, exit_code: i32, elapsed: Duration) -> Result<()> {
        self.write_line(&format!(
            "\n--- exit={exit_code} elapsed={:.1}s ---\n",
            elapsed.as_secs_f64()
        ))
    }

    pub fn event(&mut self, msg: &str) -> Result<()> {
        self.write_line(&format!("[{}] {msg}", Local::now().to_rfc3339()))
    }

    fn write_line(&mut self, text: &str) -> Result<()> {
        writeln!(self.file, "{text}")
            .and_then(|()| self.file.flush())
            .with_context(|| format!("Failed to write log file {}", self.path.display()))
    }
}
