//! Background usage monitor
//!
//! Polls a usage source on its own schedule and pauses the loop before
//! the provider starts rejecting work. When usage crosses the threshold
//! mid-invocation the monitor raises the cancel flag, so the runner
//! kills the in-flight call instead of spending quota on work that
//! would be rejected anyway.

pub mod source;

use chrono::{DateTime, Utc};
use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::MonitorConfig;
use source::{UsageSnapshot, UsageSource};

/// Bounded join on stop: a wedged usage check must not hang shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Pause/resume state, all guarded by one mutex. The poller and the
/// synchronous re-checks inside `wait_if_needed` are the only writers.
#[derive(Debug, Default)]
struct MonitorState {
    should_pause: bool,
    pause_until: Option<DateTime<Utc>>,
    last_utilization: f64,
}

/// Condvar-backed stop signal, so the poller's interval sleep wakes
/// immediately when `stop()` is called instead of finishing the
/// interval first.
#[derive(Default)]
struct StopFlag {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopFlag {
    fn raise(&self) {
        if let Ok(mut stopped) = self.stopped.lock() {
            *stopped = true;
        }
        self.condvar.notify_all();
    }

    /// Sleep up to `timeout`, cut short when the flag is raised.
    /// Returns true when raised.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut stopped) = self.stopped.lock() else {
            return true;
        };
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.condvar.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => stopped = guard,
                Err(_) => return true,
            }
        }
        true
    }
}

/// Background thread that periodically checks usage and signals the
/// loop to pause, resume, or cancel in-flight work.
pub struct UsageMonitor {
    config: MonitorConfig,
    source: Arc<dyn UsageSource>,
    state: Arc<Mutex<MonitorState>>,
    stop: Arc<StopFlag>,
    cancel: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    enabled: bool,
}

impl UsageMonitor {
    pub fn new(config: MonitorConfig, source: Arc<dyn UsageSource>) -> Self {
        Self {
            config,
            source,
            state: Arc::new(Mutex::new(MonitorState::default())),
            stop: Arc::new(StopFlag::default()),
            cancel: Arc::new(AtomicBool::new(false)),
            handle: None,
            enabled: false,
        }
    }

    /// Flag the runner watches. Raised to kill an in-flight
    /// invocation, cleared when a check shows usage back below the
    /// threshold.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().map(|s| s.should_pause).unwrap_or(false)
    }

    /// Start the background poller.
    ///
    /// The first check runs synchronously so the pause flag is correct
    /// before the loop's first iteration. An initial check failure is
    /// tolerated; the poller keeps trying on schedule.
    pub fn start(&mut self) {
        self.enabled = self.config.enabled && self.source.available();
        if !self.enabled {
            println!(
                "  {} no usage source available, monitoring disabled",
                "[monitor]".dimmed()
            );
            return;
        }

        let threshold = self.config.threshold;
        let interval = self.config.check_interval.as_secs();
        match self.source.check() {
            Ok(snapshot) => {
                if let Ok(mut state) = self.state.lock() {
                    state.last_utilization = snapshot.utilization;
                    if snapshot.utilization >= threshold {
                        state.should_pause = true;
                        state.pause_until = snapshot.resets_at;
                    }
                }
                println!(
                    "  {} started (threshold={threshold}%, interval={interval}s, current={:.1}%)",
                    "[monitor]".dimmed(),
                    snapshot.utilization
                );
            }
            Err(e) => {
                println!(
                    "  {} started (threshold={threshold}%, interval={interval}s, initial check failed: {e})",
                    "[monitor]".dimmed()
                );
            }
        }

        let config = self.config.clone();
        let source = Arc::clone(&self.source);
        let state = Arc::clone(&self.state);
        let stop = Arc::clone(&self.stop);
        let cancel = Arc::clone(&self.cancel);
        self.handle = Some(thread::spawn(move || {
            poll_loop(&config, source.as_ref(), &state, &stop, &cancel);
        }));
    }

    /// Signal the poller to stop and join it with a bounded wait.
    pub fn stop(&mut self) {
        self.stop.raise();
        if let Some(handle) = self.handle.take() {
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < JOIN_TIMEOUT {
                thread::sleep(JOIN_CHECK_INTERVAL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                eprintln!("Warning: monitor thread did not terminate within timeout");
            }
        }
    }

    /// Block while usage is above the threshold. Called by the loop
    /// before each iteration and again after a cancelled one.
    ///
    /// Sleeps are capped at `check_interval` so a far-future (or
    /// stale) reset time never turns into one giant blind sleep, and
    /// they watch `interrupt` so ctrl-c cuts a pause short. A failing
    /// re-check fails open: a broken usage source must not block the
    /// loop forever.
    pub fn wait_if_needed(&self, interrupt: &AtomicBool) {
        if !self.enabled {
            return;
        }

        loop {
            if interrupt.load(Ordering::SeqCst) {
                return;
            }

            let (pause_until, utilization) = {
                let Ok(state) = self.state.lock() else { return };
                if !state.should_pause {
                    return;
                }
                (state.pause_until, state.last_utilization)
            };

            let wait = sleep_duration(pause_until, self.config.check_interval, Utc::now());
            println!(
                "  {} usage at {utilization:.1}% (>= {}%), waiting {}s",
                "[monitor]".yellow(),
                self.config.threshold,
                wait.as_secs()
            );

            if sleep_interruptible(wait, interrupt) {
                return;
            }

            match self.source.check() {
                Ok(snapshot) => {
                    let resumed = {
                        let Ok(mut state) = self.state.lock() else { return };
                        state.last_utilization = snapshot.utilization;
                        if snapshot.utilization < self.config.threshold {
                            state.should_pause = false;
                            state.pause_until = None;
                            true
                        } else {
                            state.pause_until = snapshot.resets_at;
                            false
                        }
                    };
                    if resumed {
                        self.cancel.store(false, Ordering::SeqCst);
                        println!(
                            "  {} usage dropped to {:.1}%, resuming",
                            "[monitor]".green(),
                            snapshot.utilization
                        );
                        return;
                    }
                }
                Err(e) => {
                    if let Ok(mut state) = self.state.lock() {
                        state.should_pause = false;
                        state.pause_until = None;
                    }
                    self.cancel.store(false, Ordering::SeqCst);
                    println!(
                        "  {} check failed ({e}), resuming anyway",
                        "[monitor]".yellow()
                    );
                    return;
                }
            }
        }
    }
}

fn poll_loop(
    config: &MonitorConfig,
    source: &dyn UsageSource,
    state: &Mutex<MonitorState>,
    stop: &StopFlag,
    cancel: &AtomicBool,
) {
    loop {
        match source.check() {
            Ok(snapshot) => apply_check(state, cancel, &snapshot, config.threshold),
            Err(e) => {
                // State unchanged; the next check proceeds on schedule
                println!("  {} check failed: {e}", "[monitor]".dimmed());
            }
        }

        if stop.wait_timeout(config.check_interval) {
            return;
        }
    }
}

/// Apply one poll result to the pause state.
///
/// Above threshold: pause, refresh the reset time, and raise the
/// cancel flag so an in-flight invocation dies. Below: resume and
/// clear the cancel flag, so a cancellation raced against a natural
/// exit can never leak into the next iteration.
fn apply_check(
    state: &Mutex<MonitorState>,
    cancel: &AtomicBool,
    snapshot: &UsageSnapshot,
    threshold: f64,
) {
    let Ok(mut state) = state.lock() else { return };
    state.last_utilization = snapshot.utilization;
    if snapshot.utilization >= threshold {
        if !state.should_pause {
            println!(
                "  {} usage at {:.1}%, cancelling current iteration",
                "[monitor]".yellow(),
                snapshot.utilization
            );
        }
        state.should_pause = true;
        state.pause_until = snapshot.resets_at;
        cancel.store(true, Ordering::SeqCst);
    } else {
        state.should_pause = false;
        state.pause_until = None;
        cancel.store(false, Ordering::SeqCst);
    }
}

/// How long to sleep while paused: time to the reset, capped at the
/// check interval, with the interval as fallback when no reset time is
/// known or it already passed.
fn sleep_duration(
    pause_until: Option<DateTime<Utc>>,
    check_interval: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let until_reset = pause_until
        .and_then(|t| (t - now).to_std().ok())
        .filter(|d| !d.is_zero());
    match until_reset {
        Some(d) => d.min(check_interval),
        None => check_interval,
    }
}

/// Sleep in small slices, returning early (true) when the interrupt
/// flag is raised.
pub(crate) fn sleep_interruptible(total: Duration, interrupt: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    loop {
        if interrupt.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(SLICE));
    }
}
