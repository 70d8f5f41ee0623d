//! Output detection and extraction
//!
//! Pure functions over captured agent output. Nothing here does IO or
//! touches shared state; the loop feeds these with the raw capture and
//! acts on the answers.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::provider::Provider;

// Text fallback patterns for session/usage limits
static SESSION_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"usage limit",
        r"5.hour.*limit",
        r"limit.*reached.*try.*back",
        r"usage.*limit.*reached",
        r"quota exceeded",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("Invalid regex"))
    .collect()
});

// Phrases that mean the agent asked for input instead of working.
// In -p mode it cannot block on stdin; it prints the question and
// exits, so these only ever show up in completed output.
static INPUT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"would you like",
        r"shall I",
        r"do you want",
        r"please confirm",
        r"waiting for .* input",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).expect("Invalid regex"))
    .collect()
});

/// Check for a structured `rate_limit_event` with status `rejected`.
///
/// Lines that parse as JSON are trusted outright. A marker line that
/// fails to parse (truncated or interleaved output) only counts when
/// the rejection status sits on that same line.
pub fn detect_rate_limit(output: &str) -> bool {
    for line in output.lines() {
        if !line.contains("\"rate_limit_event\"") {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(obj) => {
                let status = obj
                    .get("rate_limit_event")
                    .and_then(|event| event.get("status"))
                    .and_then(Value::as_str);
                if status == Some("rejected") {
                    return true;
                }
            }
            Err(_) => {
                if line.contains("rejected") {
                    return true;
                }
            }
        }
    }
    false
}

/// Check for 5-hour usage cap / session limit phrases.
///
/// Only the last 30 lines are considered, and lines echoing tool
/// results are dropped first so quoted error text in a tool payload
/// cannot trip the detector.
pub fn detect_session_limit(output: &str) -> bool {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(30);
    let filtered = lines[start..]
        .iter()
        .filter(|line| !line.contains("\"tool_result\"") && !line.contains("\"tool_use_id\""))
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    SESSION_LIMIT_PATTERNS.iter().any(|p| p.is_match(&filtered))
}

/// Check whether the agent asked for user input instead of doing the task.
pub fn detect_asking_input(display_text: &str) -> bool {
    INPUT_PATTERNS.iter().any(|p| p.is_match(display_text))
}

/// Extract the `.result` field from Claude CLI JSON output.
///
/// Falls back to the raw text unchanged when the output is not the
/// expected JSON shape. Never panics on malformed input.
pub fn extract_result_text(output: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(output) {
        match &value {
            Value::Object(obj) => {
                if let Some(result) = obj.get("result").and_then(Value::as_str) {
                    return result.to_string();
                }
            }
            Value::Array(items) => {
                for item in items {
                    if item.get("type").and_then(Value::as_str) == Some("result") {
                        if let Some(result) = item.get("result").and_then(Value::as_str) {
                            return result.to_string();
                        }
                    }
                }
            }
            _ => {}
        }
    }
    output.to_string()
}

/// Extract the model's response text from `codex exec` output.
///
/// Codex interleaves session metadata on stderr. The response appears
/// after the last line that is exactly `codex`, up to a line that is
/// exactly `tokens used`.
pub fn extract_codex_response(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let Some(codex_idx) = lines.iter().rposition(|line| line.trim() == "codex") else {
        return output.to_string();
    };
    let mut response = Vec::new();
    for line in &lines[codex_idx + 1..] {
        if line.trim() == "tokens used" {
            break;
        }
        response.push(*line);
    }
    response.join("\n")
}

/// Human-readable display text for the provider's raw output.
pub fn get_display_text(provider: Provider, raw_output: &str) -> String {
    match provider {
        Provider::Claude => extract_result_text(raw_output),
        Provider::Codex => extract_codex_response(raw_output),
    }
}

/// Extract the session ID from Claude CLI JSON output for `--resume`.
pub fn extract_session_id(output: &str) -> Option<String> {
    let value: Value = serde_json::from_str(output).ok()?;
    let non_empty = |v: &Value| {
        v.as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    match &value {
        Value::Object(obj) => obj
            .get("metadata")
            .and_then(|m| m.get("session_id"))
            .and_then(|v| non_empty(v))
            .or_else(|| obj.get("session_id").and_then(|v| non_empty(v)))
            .or_else(|| obj.get("sessionId").and_then(|v| non_empty(v))),
        Value::Array(items) => items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("result"))
            .find_map(|item| {
                item.get("session_id")
                    .and_then(|v| non_empty(v))
                    .or_else(|| item.get("sessionId").and_then(|v| non_empty(v)))
            }),
        _ => None,
    }
}

/// Check for the explicit completion marker: a line that is exactly
/// `DONE` within the last five lines of display text.
pub fn find_done_marker(display_text: &str) -> bool {
    display_text
        .trim()
        .lines()
        .rev()
        .take(5)
        .any(|line| line.trim() == "DONE")
}
