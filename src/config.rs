//! Loop and monitor configuration
//!
//! Defaults live here; an optional `weft.toml` in the workspace can
//! override them, and CLI flags override both.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::provider::Provider;

/// Configuration for the iteration loop
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub provider: Provider,
    pub model: Option<String>,
    /// Wall-clock limit for a single agent invocation.
    pub timeout: Duration,
    /// Sleep applied after a rate-limit or session-limit iteration.
    pub limit_wait: Duration,
    /// Stop after this many iterations. 0 = unlimited.
    pub max_iterations: u32,
    /// Ask the feedback reviewer after each successful iteration.
    pub feedback: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Claude,
            model: None,
            timeout: Duration::from_secs(900),
            limit_wait: Duration::from_secs(3600),
            max_iterations: 0,
            feedback: true,
        }
    }
}

/// Configuration for the usage monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Cadence of background usage checks, and the cap on any single
    /// pause sleep.
    pub check_interval: Duration,
    /// Utilization percentage at which the loop pauses.
    pub threshold: f64,
    pub enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            threshold: 95.0,
            enabled: true,
        }
    }
}

/// Optional overrides parsed from `<workspace>/weft.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default, rename = "loop")]
    pub loop_overrides: LoopOverrides,
    #[serde(default)]
    pub monitor: MonitorOverrides,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoopOverrides {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub timeout: Option<u64>,
    pub limit_wait: Option<u64>,
    pub max_iterations: Option<u32>,
    pub feedback: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MonitorOverrides {
    pub check_interval: Option<u64>,
    pub threshold: Option<f64>,
    pub enabled: Option<bool>,
}

impl FileConfig {
    pub fn apply(&self, loop_config: &mut LoopConfig, monitor_config: &mut MonitorConfig) {
        let l = &self.loop_overrides;
        if let Some(provider) = l.provider {
            loop_config.provider = provider;
        }
        if let Some(model) = &l.model {
            loop_config.model = Some(model.clone());
        }
        if let Some(secs) = l.timeout {
            loop_config.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = l.limit_wait {
            loop_config.limit_wait = Duration::from_secs(secs);
        }
        if let Some(n) = l.max_iterations {
            loop_config.max_iterations = n;
        }
        if let Some(feedback) = l.feedback {
            loop_config.feedback = feedback;
        }

        let m = &self.monitor;
        if let Some(secs) = m.check_interval {
            monitor_config.check_interval = Duration::from_secs(secs);
        }
        if let Some(threshold) = m.threshold {
            monitor_config.threshold = threshold;
        }
        if let Some(enabled) = m.enabled {
            monitor_config.enabled = enabled;
        }
    }
}

/// Load `weft.toml` from the workspace if present.
///
/// Returns `Ok(None)` when the file does not exist; read or parse
/// failures are errors so a broken config never silently falls back to
/// defaults.
pub fn load_file_config(workspace: &Path) -> Result<Option<FileConfig>> {
    let config_path = workspace.join("weft.toml");

    if !config_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&config_path).context("Failed to read weft.toml")?;
    let config: FileConfig = toml::from_str(&content).context("Failed to parse weft.toml")?;

    Ok(Some(config))
}
