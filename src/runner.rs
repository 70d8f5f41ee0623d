//! Agent process execution
//!
//! Runs one agent invocation as an isolated process group, streams its
//! combined output, and enforces the wall-clock timeout plus the
//! monitor's cancellation signal. Exit codes 124 and 125 are reserved
//! sentinels for timeout and cancellation; everything else is the
//! child's own status.

use anyhow::{Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

use crate::provider::AgentCommand;

/// Exit code reported when an invocation exceeds its wall-clock timeout.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when the monitor cancelled an invocation.
pub const EXIT_CANCELLED: i32 = 125;

/// How often the wait loop wakes to drain output and check the cancel
/// flag and the deadline.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// How long to keep draining reader threads after the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of a single agent invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Combined stdout and stderr, in arrival order.
    pub output: String,
    pub exit_code: i32,
    pub elapsed: Duration,
}

/// Shared handle to the currently running child's process group.
///
/// Created by the run command and handed to both the runner and the
/// ctrl-c handler, so an interrupt can kill the child without any
/// module-level state.
#[derive(Debug, Clone, Default)]
pub struct ActiveChild {
    pgid: Arc<Mutex<Option<i32>>>,
}

impl ActiveChild {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, pgid: i32) {
        if let Ok(mut slot) = self.pgid.lock() {
            *slot = Some(pgid);
        }
    }

    fn clear(&self) {
        if let Ok(mut slot) = self.pgid.lock() {
            *slot = None;
        }
    }

    /// SIGKILL the active process group, if any. Races with natural
    /// exit are ignored.
    pub fn kill_group(&self) {
        if let Ok(slot) = self.pgid.lock() {
            if let Some(pgid) = *slot {
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
            }
        }
    }
}

/// Runs one invocation to completion. Implemented by [`ProcessRunner`]
/// and by scripted runners in tests.
pub trait AgentRunner {
    fn run(
        &self,
        command: &AgentCommand,
        cwd: &Path,
        timeout: Duration,
        cancel: &AtomicBool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<RunOutcome>;
}

pub struct ProcessRunner {
    active: ActiveChild,
}

impl ProcessRunner {
    pub fn new(active: ActiveChild) -> Self {
        Self { active }
    }
}

impl AgentRunner for ProcessRunner {
    fn run(
        &self,
        command: &AgentCommand,
        cwd: &Path,
        timeout: Duration,
        cancel: &AtomicBool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<RunOutcome> {
        let start = Instant::now();

        let mut cmd = command.to_command();
        // A fresh process group isolates the child from terminal SIGINT;
        // killing the group takes down any grandchildren with it.
        cmd.current_dir(cwd)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start '{}'", command.program))?;

        // process_group(0) makes the child a group leader with pgid == pid
        let pgid = child.id() as i32;
        self.active.set(pgid);

        let (tx, rx) = mpsc::channel::<String>();
        spawn_reader(child.stdout.take(), tx.clone());
        spawn_reader(child.stderr.take(), tx);

        let mut output = String::new();

        let exit_code = loop {
            while let Ok(line) = rx.try_recv() {
                on_line(&line);
                output.push_str(&line);
                output.push('\n');
            }

            let waited = match child.wait_timeout(WAIT_SLICE) {
                Ok(waited) => waited,
                Err(e) => {
                    kill_group_and_reap(pgid, &mut child);
                    self.active.clear();
                    return Err(e).context("Failed waiting on agent process");
                }
            };
            if let Some(status) = waited {
                break exit_code_of(status);
            }

            if cancel.load(Ordering::SeqCst) {
                kill_group_and_reap(pgid, &mut child);
                break EXIT_CANCELLED;
            }

            if start.elapsed() >= timeout {
                kill_group_and_reap(pgid, &mut child);
                break EXIT_TIMEOUT;
            }
        };

        self.active.clear();

        // Readers hit EOF once every process holding the pipe is gone.
        // The drain window is bounded so a straggler that escaped the
        // group cannot hang the loop.
        while let Ok(line) = rx.recv_timeout(DRAIN_TIMEOUT) {
            on_line(&line);
            output.push_str(&line);
            output.push('\n');
        }

        Ok(RunOutcome {
            output,
            exit_code,
            elapsed: start.elapsed(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>, tx: mpsc::Sender<String>) {
    let Some(source) = source else { return };
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn kill_group_and_reap(pgid: i32, child: &mut Child) {
    // ESRCH means the group died between the decision and the kill
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
    let _ = child.wait();
}

fn exit_code_of(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        // Killed by a signal outside our own timeout/cancel paths:
        // report it shell-style
        None => 128 + status.signal().unwrap_or(0),
    }
}
