//! Iteration orchestrator
//!
//! Drives the agent in a loop: wait out any usage pause, run one
//! invocation, classify what happened, persist a status record, and
//! decide the next prompt. Every iteration-level outcome is a retry or
//! a timed pause; the loop only stops for the operator, the DONE
//! marker, the repeated-output breaker, or the iteration cap.

pub mod events;
pub mod feedback;

use anyhow::Result;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::LoopConfig;
use crate::monitor::{sleep_interruptible, UsageMonitor};
use crate::parse::{extract_session_id, find_done_marker, get_display_text};
use crate::provider::{build_command, Provider};
use crate::runner::AgentRunner;
use crate::session_log::SessionLog;
use crate::status::write_status;
use events::{classify, IterationEvent, OutputBreaker, StopReason};
use feedback::FeedbackSource;

/// Prompt template used when the reviewer produced feedback.
const CONTINUE_TEMPLATE: &str = include_str!("../../prompts/continue_with_feedback.md");

/// Prompt used when there is no reviewer or it produced nothing.
const DEFAULT_CONTINUATION: &str = "continue";

/// At most this many display lines are echoed to the console per
/// iteration; the session log always gets everything.
const DISPLAY_TAIL_LINES: usize = 30;

/// How the run ended and how many iterations it took.
#[derive(Debug, Clone, Copy)]
pub struct LoopSummary {
    pub iterations: u32,
    pub reason: StopReason,
}

pub struct Looper {
    config: LoopConfig,
    workspace: PathBuf,
    original_task: String,
    monitor: UsageMonitor,
    runner: Box<dyn AgentRunner>,
    feedback: Option<Box<dyn FeedbackSource>>,
    interrupt: Arc<AtomicBool>,
}

impl Looper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoopConfig,
        workspace: PathBuf,
        original_task: String,
        monitor: UsageMonitor,
        runner: Box<dyn AgentRunner>,
        feedback: Option<Box<dyn FeedbackSource>>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            workspace,
            original_task,
            monitor,
            runner,
            feedback,
            interrupt,
        }
    }

    /// Run iterations until a stop condition. Always stops the monitor
    /// and records the stop reason in the session log before returning.
    pub fn run(&mut self) -> Result<LoopSummary> {
        let mut log = SessionLog::create(&self.workspace)?;

        let max = if self.config.max_iterations == 0 {
            "unlimited".to_string()
        } else {
            self.config.max_iterations.to_string()
        };
        println!(
            "{} | provider={} timeout={}s limit_wait={}s max={max}",
            "weft".cyan().bold(),
            self.config.provider,
            self.config.timeout.as_secs(),
            self.config.limit_wait.as_secs(),
        );
        println!("workspace: {}", self.workspace.display());
        println!("log: {}", log.path().display());
        println!("{}", "-".repeat(60));

        self.monitor.start();

        let cancel = self.monitor.cancel_flag();
        let mut session_id: Option<String> = None;
        let mut next_prompt = self.original_task.clone();
        let mut breaker = OutputBreaker::default();
        let mut iteration: u32 = 0;

        let reason = loop {
            if self.interrupt.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }
            if self.config.max_iterations > 0 && iteration >= self.config.max_iterations {
                println!(
                    "\nHit max iterations ({}), stopping",
                    self.config.max_iterations
                );
                break StopReason::MaxIterations;
            }

            // Sole serialization point between the monitor's pause
            // state and new work.
            self.monitor.wait_if_needed(&self.interrupt);
            if self.interrupt.load(Ordering::SeqCst) {
                break StopReason::Interrupted;
            }

            iteration += 1;

            let resume = match self.config.provider {
                Provider::Claude => session_id.as_deref(),
                Provider::Codex => None,
            };
            let command = build_command(
                self.config.provider,
                &next_prompt,
                resume,
                self.config.model.as_deref(),
            );

            match &session_id {
                Some(sid) => {
                    let shown: String = sid.chars().take(20).collect();
                    println!("\n{} iteration {iteration} (session: {shown}...)", ">>".cyan());
                }
                None => println!("\n{} iteration {iteration}", ">>".cyan()),
            }
            log.iteration_start(iteration, &command)?;

            let outcome = self.runner.run(
                &command,
                &self.workspace,
                self.config.timeout,
                &cancel,
                &mut |line| log.raw_line(line),
            )?;
            log.iteration_end(outcome.exit_code, outcome.elapsed)?;

            let display_text = get_display_text(self.config.provider, &outcome.output);
            let lines: Vec<&str> = display_text.trim().lines().collect();
            let tail_start = lines.len().saturating_sub(DISPLAY_TAIL_LINES);
            for line in &lines[tail_start..] {
                println!("  {line}");
            }
            println!(
                "\n  exit={} time={:.0}s lines={}",
                outcome.exit_code,
                outcome.elapsed.as_secs_f64(),
                lines.len()
            );

            let event = classify(outcome.exit_code, &outcome.output, &display_text);
            let record = |session_id: Option<&str>| {
                write_status(
                    &self.workspace,
                    iteration,
                    event.as_str(),
                    outcome.exit_code,
                    outcome.elapsed,
                    session_id,
                    &outcome.output,
                )
            };

            match event {
                IterationEvent::RateCancelled => {
                    println!("  {} cancelled by usage monitor", "**".yellow());
                    log.event("cancelled by usage monitor")?;
                    record(session_id.as_deref())?;
                    // The monitor raised the pause that killed the
                    // child; wait it out, then retry the same prompt.
                    self.monitor.wait_if_needed(&self.interrupt);
                }
                IterationEvent::Timeout => {
                    println!("  {} timed out, retrying", "**".yellow());
                    log.event("timeout, retrying")?;
                    record(session_id.as_deref())?;
                }
                IterationEvent::RateLimit => {
                    let wait = self.config.limit_wait.as_secs();
                    println!("  {} rate limit (rejected), waiting {wait}s", "**".yellow());
                    log.event(&format!("rate limit, waiting {wait}s"))?;
                    record(session_id.as_deref())?;
                    sleep_interruptible(self.config.limit_wait, &self.interrupt);
                }
                IterationEvent::SessionLimit => {
                    let wait = self.config.limit_wait.as_secs();
                    println!("  {} session limit hit, waiting {wait}s", "**".yellow());
                    log.event(&format!("session limit, waiting {wait}s"))?;
                    record(session_id.as_deref())?;
                    sleep_interruptible(self.config.limit_wait, &self.interrupt);
                }
                IterationEvent::AskedInput => {
                    // The preamble forbids asking; retrying the same
                    // prompt is enough to get back on track.
                    println!("  {} agent asked for input, retrying", "**".yellow());
                    log.event("agent asked for input, retrying")?;
                    record(session_id.as_deref())?;
                }
                IterationEvent::Error | IterationEvent::Ok => {
                    if event == IterationEvent::Ok && self.config.provider == Provider::Claude {
                        if let Some(sid) = extract_session_id(&outcome.output) {
                            session_id = Some(sid);
                        }
                    }

                    let streak = breaker.observe(&outcome.output);
                    if breaker.tripped() {
                        println!(
                            "  {} output unchanged for {streak} iterations, stopping",
                            "**".red()
                        );
                        log.event("output unchanged, stopping")?;
                        record(session_id.as_deref())?;
                        break StopReason::Stalled;
                    }
                    if find_done_marker(&display_text) {
                        println!("\n{} agent signaled DONE", "ok:".green().bold());
                        log.event("agent signaled DONE")?;
                        record(session_id.as_deref())?;
                        break StopReason::Done;
                    }
                    if event == IterationEvent::Error {
                        println!(
                            "  {} exit code {}, retrying",
                            "**".yellow(),
                            outcome.exit_code
                        );
                        log.event(&format!("exit code {}, retrying", outcome.exit_code))?;
                        record(session_id.as_deref())?;
                        continue;
                    }

                    println!("  {}", "ok".green());
                    log.event("iteration ok")?;
                    record(session_id.as_deref())?;

                    next_prompt = self.continuation(&mut log)?;
                }
            }
        };

        if reason == StopReason::Interrupted {
            println!("\n\n{} after {iteration} iterations", "Interrupted".yellow());
        }
        log.event(&format!(
            "stopped after {iteration} iterations ({})",
            reason.as_str()
        ))?;
        self.monitor.stop();

        Ok(LoopSummary {
            iterations: iteration,
            reason,
        })
    }

    /// Ask the reviewer for feedback on the newest progress artifact
    /// and build the next prompt from it. No reviewer, or nothing from
    /// it, falls back to the minimal continuation.
    fn continuation(&self, log: &mut SessionLog) -> Result<String> {
        let Some(reviewer) = &self.feedback else {
            return Ok(DEFAULT_CONTINUATION.to_string());
        };

        println!("  {}", "asking reviewer for feedback...".dimmed());
        log.event("asking reviewer for feedback")?;

        match reviewer.review(&self.workspace) {
            Some(text) => {
                let shown: String = text.chars().take(200).collect();
                let ellipsis = if text.chars().count() > 200 { "..." } else { "" };
                println!("  feedback: {shown}{ellipsis}");
                log.event(&format!("feedback: {text}"))?;
                Ok(CONTINUE_TEMPLATE
                    .replace("{feedback}", &text)
                    .replace("{original_task}", &self.original_task))
            }
            None => {
                println!("  {}", "no feedback, continuing".dimmed());
                log.event("no feedback from reviewer")?;
                Ok(DEFAULT_CONTINUATION.to_string())
            }
        }
    }
}
