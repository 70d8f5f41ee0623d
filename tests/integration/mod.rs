//! Integration tests for the iteration loop
//!
//! The loop runs against a scripted runner (no real agent CLI) and a
//! scripted usage source; the background monitor thread runs for real
//! at millisecond intervals.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use weft::config::{LoopConfig, MonitorConfig};
use weft::looper::events::StopReason;
use weft::looper::feedback::FeedbackSource;
use weft::looper::{LoopSummary, Looper};
use weft::monitor::source::{UsageError, UsageSnapshot, UsageSource};
use weft::monitor::UsageMonitor;
use weft::provider::{AgentCommand, Provider};
use weft::runner::{AgentRunner, RunOutcome};
use weft::status::read_recent;

/// One scripted iteration outcome.
#[derive(Clone)]
struct Step {
    output: &'static str,
    exit_code: i32,
}

fn ok(output: &'static str) -> Step {
    Step {
        output,
        exit_code: 0,
    }
}

fn exit(output: &'static str, exit_code: i32) -> Step {
    Step { output, exit_code }
}

/// Runner that replays a fixed script and records every command it is
/// given. The last step repeats if the loop outlives the script.
struct ScriptedRunner {
    script: Vec<Step>,
    calls: Arc<Mutex<Vec<AgentCommand>>>,
}

impl ScriptedRunner {
    fn new(script: Vec<Step>) -> (Self, Arc<Mutex<Vec<AgentCommand>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = Self {
            script,
            calls: Arc::clone(&calls),
        };
        (runner, calls)
    }
}

impl AgentRunner for ScriptedRunner {
    fn run(
        &self,
        command: &AgentCommand,
        _cwd: &Path,
        _timeout: Duration,
        _cancel: &AtomicBool,
        on_line: &mut dyn FnMut(&str),
    ) -> anyhow::Result<RunOutcome> {
        let mut calls = self.calls.lock().unwrap();
        let step = &self.script[(calls.len()).min(self.script.len() - 1)];
        calls.push(command.clone());

        for line in step.output.lines() {
            on_line(line);
        }
        Ok(RunOutcome {
            output: step.output.to_string(),
            exit_code: step.exit_code,
            elapsed: Duration::from_millis(10),
        })
    }
}

/// Usage source that walks a reading sequence, sticking on the last
/// value once the sequence is exhausted.
struct SequenceSource {
    readings: Vec<f64>,
    calls: AtomicUsize,
}

impl SequenceSource {
    fn new(readings: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            readings: readings.to_vec(),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UsageSource for SequenceSource {
    fn available(&self) -> bool {
        true
    }

    fn check(&self) -> Result<UsageSnapshot, UsageError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(UsageSnapshot {
            utilization: self.readings[n.min(self.readings.len() - 1)],
            resets_at: None,
        })
    }
}

/// Source with no credentials: the monitor must disable itself.
struct UnavailableSource {
    checks: AtomicUsize,
}

impl UsageSource for UnavailableSource {
    fn available(&self) -> bool {
        false
    }

    fn check(&self) -> Result<UsageSnapshot, UsageError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Err(UsageError::Malformed("should never be called".to_string()))
    }
}

/// First check reports high usage, every later one fails.
struct HighThenFailing {
    calls: AtomicUsize,
}

impl UsageSource for HighThenFailing {
    fn available(&self) -> bool {
        true
    }

    fn check(&self) -> Result<UsageSnapshot, UsageError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(UsageSnapshot {
                utilization: 90.0,
                resets_at: None,
            })
        } else {
            Err(UsageError::Malformed("scripted failure".to_string()))
        }
    }
}

struct CannedFeedback(&'static str);

impl FeedbackSource for CannedFeedback {
    fn review(&self, _workspace: &Path) -> Option<String> {
        Some(self.0.to_string())
    }
}

fn loop_config(max_iterations: u32) -> LoopConfig {
    LoopConfig {
        provider: Provider::Claude,
        model: None,
        timeout: Duration::from_secs(5),
        limit_wait: Duration::from_millis(50),
        max_iterations,
        feedback: false,
    }
}

fn monitor_config(interval: Duration, threshold: f64) -> MonitorConfig {
    MonitorConfig {
        check_interval: interval,
        threshold,
        enabled: true,
    }
}

fn run_loop(
    workspace: &Path,
    config: LoopConfig,
    monitor: UsageMonitor,
    runner: ScriptedRunner,
    feedback: Option<Box<dyn FeedbackSource>>,
) -> LoopSummary {
    let mut looper = Looper::new(
        config,
        workspace.to_path_buf(),
        "test task".to_string(),
        monitor,
        Box::new(runner),
        feedback,
        Arc::new(AtomicBool::new(false)),
    );
    looper.run().unwrap()
}

fn recorded_events(workspace: &Path) -> Vec<String> {
    read_recent(workspace, 50)
        .unwrap()
        .into_iter()
        .map(|r| r.event)
        .collect()
}

fn prompt_of(command: &AgentCommand) -> String {
    command.args.last().unwrap().clone()
}

#[test]
fn test_low_usage_runs_to_iteration_cap() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, calls) = ScriptedRunner::new(vec![
        ok(r#"{"result":"first pass","session_id":"sess-1"}"#),
        ok(r#"{"result":"second pass","session_id":"sess-2"}"#),
    ]);

    let summary = run_loop(dir.path(), loop_config(2), monitor, runner, None);

    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.reason, StopReason::MaxIterations);
    assert_eq!(summary.reason.exit_code(), 2);
    assert_eq!(recorded_events(dir.path()), vec!["ok", "ok"]);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    // First iteration carries the task, no resume yet
    assert!(prompt_of(&calls[0]).ends_with("test task"));
    assert!(!calls[0].args.contains(&"--resume".to_string()));
    // Second iteration resumes the extracted session with the default
    // continuation
    let resume_pos = calls[1].args.iter().position(|a| a == "--resume").unwrap();
    assert_eq!(calls[1].args[resume_pos + 1], "sess-1");
    assert!(prompt_of(&calls[1]).ends_with("continue"));
}

#[test]
fn test_high_usage_pauses_then_resumes() {
    let dir = TempDir::new().unwrap();
    // 90, 90, then 10: pause at startup, re-check until usage drops
    let source = SequenceSource::new(&[90.0, 90.0, 10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(30), 50.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, calls) = ScriptedRunner::new(vec![ok(r#"{"result":"hello"}"#)]);

    let start = Instant::now();
    let summary = run_loop(dir.path(), loop_config(1), monitor, runner, None);
    let elapsed = start.elapsed();

    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.reason, StopReason::MaxIterations);
    // The startup check saw 90 and the resume needed the third reading
    assert!(source.call_count() >= 3);
    // At least one capped pause sleep happened, and nothing stretched
    // the pause beyond the interval cap
    assert!(elapsed >= Duration::from_millis(30));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn test_unavailable_source_disables_monitor_but_loop_runs() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(UnavailableSource {
        checks: AtomicUsize::new(0),
    });
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(20), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![ok("plain text output")]);

    let summary = run_loop(dir.path(), loop_config(1), monitor, runner, None);

    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.reason, StopReason::MaxIterations);
    // A disabled monitor never polls
    assert_eq!(source.checks.load(Ordering::SeqCst), 0);
}

#[test]
fn test_breaker_stops_on_three_identical_outputs() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    // Unlimited iterations: only the breaker can stop this script
    let (runner, _) = ScriptedRunner::new(vec![ok("same output every time")]);

    let summary = run_loop(dir.path(), loop_config(0), monitor, runner, None);

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.reason, StopReason::Stalled);
    assert_eq!(summary.reason.exit_code(), 1);
    assert_eq!(recorded_events(dir.path()), vec!["ok", "ok", "ok"]);
}

#[test]
fn test_breaker_resets_when_an_output_differs() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![
        ok("same output"),
        ok("same output"),
        ok("different output"),
        ok("same output"),
    ]);

    let summary = run_loop(dir.path(), loop_config(4), monitor, runner, None);

    // The third output broke the streak, so the cap is what stops us
    assert_eq!(summary.iterations, 4);
    assert_eq!(summary.reason, StopReason::MaxIterations);
}

#[test]
fn test_timeout_retries_with_unchanged_prompt() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, calls) = ScriptedRunner::new(vec![
        exit("partial output before the kill", 124),
        ok(r#"{"result":"recovered"}"#),
    ]);

    let summary = run_loop(dir.path(), loop_config(2), monitor, runner, None);

    assert_eq!(summary.iterations, 2);
    assert_eq!(recorded_events(dir.path()), vec!["timeout", "ok"]);

    // A timed-out iteration never advances the continuation state
    let calls = calls.lock().unwrap();
    assert_eq!(prompt_of(&calls[0]), prompt_of(&calls[1]));
    assert!(!calls[1].args.contains(&"--resume".to_string()));
}

#[test]
fn test_cancelled_iteration_retries_same_prompt() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, calls) = ScriptedRunner::new(vec![
        exit("killed mid-flight", 125),
        ok(r#"{"result":"recovered"}"#),
    ]);

    let summary = run_loop(dir.path(), loop_config(2), monitor, runner, None);

    assert_eq!(summary.iterations, 2);
    assert_eq!(recorded_events(dir.path()), vec!["rate_cancelled", "ok"]);
    let calls = calls.lock().unwrap();
    assert_eq!(prompt_of(&calls[0]), prompt_of(&calls[1]));
}

#[test]
fn test_failing_recheck_fails_open() {
    let dir = TempDir::new().unwrap();
    // Startup check pauses the loop; every re-check fails, so the
    // pause must fail open instead of blocking forever
    let source = Arc::new(HighThenFailing {
        calls: AtomicUsize::new(0),
    });
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(30), 50.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![ok(r#"{"result":"made it"}"#)]);

    let start = Instant::now();
    let summary = run_loop(dir.path(), loop_config(1), monitor, runner, None);

    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.reason, StopReason::MaxIterations);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_rate_limit_sleeps_before_retrying() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![
        ok(r#"{"rate_limit_event":{"status":"rejected"}}"#),
        ok(r#"{"result":"after the wait"}"#),
    ]);

    let mut config = loop_config(2);
    config.limit_wait = Duration::from_millis(300);

    let start = Instant::now();
    let summary = run_loop(dir.path(), config, monitor, runner, None);

    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(summary.iterations, 2);
    assert_eq!(recorded_events(dir.path()), vec!["rate_limit", "ok"]);
}

#[test]
fn test_session_limit_sleeps_before_retrying() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![
        exit("5-hour limit reached, try back later", 1),
        ok(r#"{"result":"after the wait"}"#),
    ]);

    let mut config = loop_config(2);
    config.limit_wait = Duration::from_millis(200);

    let start = Instant::now();
    let summary = run_loop(dir.path(), config, monitor, runner, None);

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(summary.iterations, 2);
    assert_eq!(recorded_events(dir.path()), vec!["session_limit", "ok"]);
}

#[test]
fn test_done_marker_stops_the_loop() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![ok(
        r#"{"result":"All tasks complete.\nDONE","session_id":"sess-done"}"#,
    )]);

    let summary = run_loop(dir.path(), loop_config(0), monitor, runner, None);

    assert_eq!(summary.iterations, 1);
    assert_eq!(summary.reason, StopReason::Done);
    assert_eq!(summary.reason.exit_code(), 0);
}

#[test]
fn test_error_exit_retries_and_records() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![
        exit("something broke", 7),
        ok(r#"{"result":"fixed"}"#),
    ]);

    let summary = run_loop(dir.path(), loop_config(2), monitor, runner, None);

    assert_eq!(summary.iterations, 2);
    assert_eq!(recorded_events(dir.path()), vec!["error", "ok"]);
}

#[test]
fn test_feedback_shapes_the_next_prompt() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, calls) = ScriptedRunner::new(vec![
        ok(r#"{"result":"first"}"#),
        ok(r#"{"result":"second"}"#),
    ]);

    let summary = run_loop(
        dir.path(),
        loop_config(2),
        monitor,
        runner,
        Some(Box::new(CannedFeedback("tighten the error handling"))),
    );

    assert_eq!(summary.iterations, 2);
    let calls = calls.lock().unwrap();
    let second_prompt = prompt_of(&calls[1]);
    // Reviewer feedback and the original task both land in the prompt
    assert!(second_prompt.contains("tighten the error handling"));
    assert!(second_prompt.contains("test task"));
}

#[test]
fn test_codex_provider_never_resumes() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, calls) = ScriptedRunner::new(vec![
        ok("codex\nworked on it\ntokens used: 500"),
        ok("codex\nmore work\ntokens used: 600"),
    ]);

    let mut config = loop_config(2);
    config.provider = Provider::Codex;

    let summary = run_loop(dir.path(), config, monitor, runner, None);

    assert_eq!(summary.iterations, 2);
    let calls = calls.lock().unwrap();
    assert_eq!(calls[0].program, "codex");
    assert!(!calls[1].args.contains(&"--resume".to_string()));
}

#[test]
fn test_interrupt_flag_stops_before_first_iteration() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, calls) = ScriptedRunner::new(vec![ok("never runs")]);

    let interrupt = Arc::new(AtomicBool::new(true));
    let mut looper = Looper::new(
        loop_config(0),
        dir.path().to_path_buf(),
        "test task".to_string(),
        monitor,
        Box::new(runner),
        None,
        interrupt,
    );
    let summary = looper.run().unwrap();

    assert_eq!(summary.iterations, 0);
    assert_eq!(summary.reason, StopReason::Interrupted);
    assert_eq!(summary.reason.exit_code(), 130);
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn test_session_log_receives_streamed_lines() {
    let dir = TempDir::new().unwrap();
    let source = SequenceSource::new(&[10.0]);
    let monitor = UsageMonitor::new(
        monitor_config(Duration::from_millis(50), 80.0),
        Arc::clone(&source) as Arc<dyn UsageSource>,
    );
    let (runner, _) = ScriptedRunner::new(vec![ok("line one\nline two")]);

    run_loop(dir.path(), loop_config(1), monitor, runner, None);

    let logs_dir = dir.path().join("logs");
    let log_path = std::fs::read_dir(&logs_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|x| x == "log"))
        .expect("session log file");
    let content = std::fs::read_to_string(log_path).unwrap();

    assert!(content.contains("ITERATION 1"));
    assert!(content.contains("cmd: claude"));
    assert!(content.contains("line one"));
    assert!(content.contains("line two"));
    assert!(content.contains("exit=0"));
    assert!(content.contains("stopped after 1 iterations (max_iterations)"));
}
