//! Iteration outcome classification
//!
//! One pure function turns an invocation's exit code and output into
//! exactly one [`IterationEvent`]. The priority is fixed here, in one
//! place, so the loop body is a plain match with no chance of two
//! detectors disagreeing about who wins.

use sha2::{Digest, Sha256};

use crate::parse;
use crate::runner::{EXIT_CANCELLED, EXIT_TIMEOUT};

/// Consecutive identical outputs at which the loop gives up.
pub const BREAKER_LIMIT: u32 = 3;

/// What a single iteration amounted to. Mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationEvent {
    Ok,
    Timeout,
    RateCancelled,
    RateLimit,
    SessionLimit,
    AskedInput,
    Error,
}

impl IterationEvent {
    /// Stable name used in status records and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationEvent::Ok => "ok",
            IterationEvent::Timeout => "timeout",
            IterationEvent::RateCancelled => "rate_cancelled",
            IterationEvent::RateLimit => "rate_limit",
            IterationEvent::SessionLimit => "session_limit",
            IterationEvent::AskedInput => "asked_input",
            IterationEvent::Error => "error",
        }
    }
}

/// Classify one finished invocation. First match wins:
/// cancellation, timeout, rate limit, session limit, asked-for-input,
/// non-zero exit, ok.
pub fn classify(exit_code: i32, raw_output: &str, display_text: &str) -> IterationEvent {
    if exit_code == EXIT_CANCELLED {
        return IterationEvent::RateCancelled;
    }
    if exit_code == EXIT_TIMEOUT {
        return IterationEvent::Timeout;
    }
    if parse::detect_rate_limit(raw_output) {
        return IterationEvent::RateLimit;
    }
    if parse::detect_session_limit(raw_output) {
        return IterationEvent::SessionLimit;
    }
    if parse::detect_asking_input(display_text) {
        return IterationEvent::AskedInput;
    }
    if exit_code != 0 {
        return IterationEvent::Error;
    }
    IterationEvent::Ok
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Operator interrupt (ctrl-c).
    Interrupted,
    /// The agent printed the DONE marker.
    Done,
    /// Repeated-output circuit breaker tripped.
    Stalled,
    /// Configured iteration cap reached.
    MaxIterations,
}

impl StopReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            StopReason::Done => 0,
            StopReason::Stalled => 1,
            StopReason::MaxIterations => 2,
            // SIGINT convention, 128 + 2
            StopReason::Interrupted => 130,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Interrupted => "interrupted",
            StopReason::Done => "done",
            StopReason::Stalled => "stalled",
            StopReason::MaxIterations => "max_iterations",
        }
    }
}

/// Repeated-output circuit breaker.
///
/// Fed only with outputs that represent the agent's actual work (`ok`
/// and `error` iterations); infrastructure retries like timeouts and
/// rate limits never touch the streak. Compares SHA-256 digests so an
/// arbitrarily large output costs 32 bytes to remember.
#[derive(Debug, Default)]
pub struct OutputBreaker {
    last_digest: Option<String>,
    streak: u32,
}

impl OutputBreaker {
    /// Record one output. Returns the current run length of identical
    /// outputs, counting this one.
    pub fn observe(&mut self, output: &str) -> u32 {
        let digest = output_digest(output.trim());
        if self.last_digest.as_deref() == Some(digest.as_str()) {
            self.streak += 1;
        } else {
            self.streak = 1;
        }
        self.last_digest = Some(digest);
        self.streak
    }

    pub fn tripped(&self) -> bool {
        self.streak >= BREAKER_LIMIT
    }
}

fn output_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
