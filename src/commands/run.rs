//! `weft run`: wire everything together and drive the loop.

use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{load_file_config, LoopConfig, MonitorConfig};
use crate::lock::WorkspaceLock;
use crate::looper::feedback::{FeedbackSource, OpenRouterFeedback};
use crate::looper::Looper;
use crate::monitor::source::{ClaudeUsageApi, CodexSessionScan, UsageSource};
use crate::monitor::UsageMonitor;
use crate::provider::{preflight, Provider};
use crate::runner::{ActiveChild, ProcessRunner};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// The task for the agent to work on
    pub prompt: String,

    /// Agent CLI to drive
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// Model override passed through to the agent CLI
    #[arg(long)]
    pub model: Option<String>,

    /// Directory the agent works in (created if missing)
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Seconds before a stuck iteration is killed
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds to wait after a rate or session limit
    #[arg(long)]
    pub limit_wait: Option<u64>,

    /// Stop after N iterations (0 = unlimited)
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Seconds between background usage checks
    #[arg(long)]
    pub check_interval: Option<u64>,

    /// Usage percentage at which the loop pauses
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Disable the background usage monitor
    #[arg(long)]
    pub no_monitor: bool,

    /// Skip the feedback reviewer after successful iterations
    #[arg(long)]
    pub no_feedback: bool,
}

pub fn execute(args: RunArgs) -> Result<()> {
    let workspace = args
        .workspace
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"));
    fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Failed to resolve workspace {}", workspace.display()))?;

    let lock = WorkspaceLock::acquire(&workspace)?;

    let (loop_config, monitor_config) = resolve_config(&args, &workspace)?;
    preflight(loop_config.provider)?;

    // One shared handle: the runner publishes the running child's
    // process group into it, the ctrl-c handler kills through it.
    let active = ActiveChild::new();
    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let active = active.clone();
        let interrupt = Arc::clone(&interrupt);
        ctrlc::set_handler(move || {
            interrupt.store(true, Ordering::SeqCst);
            active.kill_group();
        })
        .context("Failed to install ctrl-c handler")?;
    }

    let source: Arc<dyn UsageSource> = match loop_config.provider {
        Provider::Claude => Arc::new(ClaudeUsageApi::new().context("Failed to set up usage source")?),
        Provider::Codex => Arc::new(CodexSessionScan::new()),
    };
    let monitor = UsageMonitor::new(monitor_config, source);

    let feedback: Option<Box<dyn FeedbackSource>> = if loop_config.feedback {
        Some(Box::new(OpenRouterFeedback::new()?))
    } else {
        None
    };

    let mut looper = Looper::new(
        loop_config,
        workspace,
        args.prompt,
        monitor,
        Box::new(ProcessRunner::new(active)),
        feedback,
        interrupt,
    );
    let summary = looper.run()?;

    drop(lock);
    std::process::exit(summary.reason.exit_code());
}

/// Defaults, then `weft.toml` overrides, then CLI flags.
fn resolve_config(args: &RunArgs, workspace: &std::path::Path) -> Result<(LoopConfig, MonitorConfig)> {
    let mut loop_config = LoopConfig::default();
    let mut monitor_config = MonitorConfig::default();

    if let Some(file_config) = load_file_config(workspace)? {
        file_config.apply(&mut loop_config, &mut monitor_config);
    }

    if let Some(provider) = args.provider {
        loop_config.provider = provider;
    }
    if let Some(model) = &args.model {
        loop_config.model = Some(model.clone());
    }
    if let Some(secs) = args.timeout {
        loop_config.timeout = std::time::Duration::from_secs(secs);
    }
    if let Some(secs) = args.limit_wait {
        loop_config.limit_wait = std::time::Duration::from_secs(secs);
    }
    if let Some(n) = args.max_iterations {
        loop_config.max_iterations = n;
    }
    if args.no_feedback {
        loop_config.feedback = false;
    }

    if let Some(secs) = args.check_interval {
        monitor_config.check_interval = std::time::Duration::from_secs(secs);
    }
    if let Some(threshold) = args.threshold {
        monitor_config.threshold = threshold;
    }
    if args.no_monitor {
        monitor_config.enabled = false;
    }

    Ok((loop_config, monitor_config))
}
