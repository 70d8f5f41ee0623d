//! Per-iteration status records
//!
//! Every iteration writes one JSON record into `<workspace>/status/`.
//! The same directory also holds the worker's own markdown progress
//! summaries, so readers filter by extension.

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lines of agent output kept in each record.
pub const OUTPUT_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub timestamp: String,
    pub iteration: u32,
    pub event: String,
    pub exit_code: i32,
    pub elapsed_seconds: f64,
    pub session_id: Option<String>,
    pub output_tail: String,
}

/// Write one iteration record. The filename carries the wall-clock
/// stamp, the iteration number, and the first 12 chars of the session
/// id when one is known, so a directory listing reads as a timeline.
pub fn write_status(
    workspace: &Path,
    iteration: u32,
    event: &str,
    exit_code: i32,
    elapsed: Duration,
    session_id: Option<&str>,
    output: &str,
) -> Result<PathBuf> {
    let status_dir = workspace.join("status");
    fs::create_dir_all(&status_dir)
        .with_context(|| format!("Failed to create {}", status_dir.display()))?;

    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let mut name = format!("status_{stamp}_iter{iteration}");
    if let Some(sid) = session_id {
        let short: String = sid.chars().take(12).collect();
        name.push('_');
        name.push_str(&short);
    }
    let path = status_dir.join(format!("{name}.json"));

    let record = StatusRecord {
        timestamp: Local::now().to_rfc3339(),
        iteration,
        event: event.to_string(),
        exit_code,
        elapsed_seconds: round_tenth(elapsed.as_secs_f64()),
        session_id: session_id.map(str::to_string),
        output_tail: tail_lines(output, OUTPUT_TAIL_LINES),
    };

    let json = serde_json::to_string_pretty(&record).context("Failed to serialize status record")?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Most recent records, oldest first, for the `status` command.
/// Unparseable files are skipped; the directory is shared with worker
/// output and should never make the viewer fail.
pub fn read_recent(workspace: &Path, limit: usize) -> Result<Vec<StatusRecord>> {
    let status_dir = workspace.join("status");
    if !status_dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(&status_dir)
        .with_context(|| format!("Failed to read {}", status_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| is_record_file(p, "json"))
        .collect();
    // Stamp-prefixed names sort chronologically
    paths.sort();

    let mut records: Vec<StatusRecord> = paths
        .iter()
        .rev()
        .take(limit)
        .filter_map(|path| {
            let content = fs::read_to_string(path).ok()?;
            serde_json::from_str(&content).ok()
        })
        .collect();
    records.reverse();
    Ok(records)
}

/// Newest worker-written summary (`status_*.md`), falling back to the
/// newest iteration record. This is what the feedback reviewer reads.
pub fn latest_status_file(workspace: &Path) -> Option<PathBuf> {
    let status_dir = workspace.join("status");
    let newest = |ext: &str| -> Option<PathBuf> {
        fs::read_dir(&status_dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| is_record_file(p, ext))
            .max()
    };
    newest("md").or_else(|| newest("json"))
}

fn is_record_file(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|x| x == ext)
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("status_"))
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

fn round_tenth(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
