//! `weft status`: show recent iteration records for a workspace.

use anyhow::Result;
use colored::{ColoredString, Colorize};
use std::path::PathBuf;

use crate::status::{read_recent, StatusRecord};

pub fn execute(workspace: Option<PathBuf>, limit: usize) -> Result<()> {
    let workspace = workspace.unwrap_or_else(|| PathBuf::from("workspace"));
    let records = read_recent(&workspace, limit)?;

    println!("{}", "Weft Status".bold().blue());
    println!("{}", "=".repeat(50));

    if records.is_empty() {
        println!(
            "\nNo status records in {}",
            workspace.join("status").display()
        );
        println!("Start a run with 'weft run <prompt>'");
        return Ok(());
    }

    println!(
        "\n{}",
        format!(
            "{:<5} {:<14} {:>5} {:>8}  {:<19}  session",
            "iter", "event", "exit", "time", "timestamp"
        )
        .bold()
    );
    for record in &records {
        println!(
            "{:<5} {} {:>5} {:>7.1}s  {:<19}  {}",
            record.iteration,
            event_cell(record),
            record.exit_code,
            record.elapsed_seconds,
            short_timestamp(&record.timestamp),
            short_session(record),
        );
    }

    println!();
    Ok(())
}

/// Pad before colorizing; ANSI escapes would otherwise throw the
/// column widths off.
fn event_cell(record: &StatusRecord) -> ColoredString {
    let padded = format!("{:<14}", record.event);
    match record.event.as_str() {
        "ok" => padded.green(),
        "error" => padded.red(),
        _ => padded.yellow(),
    }
}

fn short_timestamp(timestamp: &str) -> String {
    timestamp.chars().take(19).collect()
}

fn short_session(record: &StatusRecord) -> String {
    match &record.session_id {
        Some(sid) => sid.chars().take(12).collect(),
        None => "-".to_string(),
    }
}
