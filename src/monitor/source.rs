//! Usage sources
//!
//! Claude: polls GET <https://api.anthropic.com/api/oauth/usage>
//! Codex: reads ~/.codex/sessions/ JSONL files for rate limit data
//!
//! Both shapes normalize to a [`UsageSnapshot`] so the monitor never
//! cares where a reading came from.

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use thiserror::Error;

const USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
/// Beta header required by the OAuth usage endpoint.
const OAUTH_BETA: &str = "oauth-2025-04-20";
/// The endpoint only answers to a Claude Code client.
const USAGE_USER_AGENT: &str = "claude-code/2.0.32";
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// One normalized usage reading.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSnapshot {
    /// Percent of quota consumed, 0 to 100, maximum across the
    /// source's reporting windows.
    pub utilization: f64,
    /// When the window that supplied the maximum resets, if reported.
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage endpoint returned HTTP {0}")]
    Http(u16),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("malformed usage data: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A pollable quota signal. The monitor owns one and never looks
/// behind this seam.
pub trait UsageSource: Send + Sync {
    /// Whether the source can produce readings at all. Checked once at
    /// startup to decide monitor enablement.
    fn available(&self) -> bool;

    fn check(&self) -> Result<UsageSnapshot, UsageError>;
}

/// Read the OAuth token from the env var or ~/.claude/.credentials.json.
pub fn load_oauth_token() -> Option<String> {
    if let Ok(token) = std::env::var("CLAUDE_CODE_OAUTH_TOKEN") {
        if !token.is_empty() {
            return Some(token);
        }
    }
    let creds_path = dirs::home_dir()?.join(".claude").join(".credentials.json");
    let content = fs::read_to_string(creds_path).ok()?;
    let creds: Value = serde_json::from_str(&content).ok()?;
    creds
        .get("claudeAiOauth")
        .and_then(|oauth| oauth.get("accessToken"))
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Claude OAuth usage endpoint.
pub struct ClaudeUsageApi {
    client: Client,
}

impl ClaudeUsageApi {
    pub fn new() -> Result<Self, UsageError> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .user_agent(USAGE_USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

impl UsageSource for ClaudeUsageApi {
    fn available(&self) -> bool {
        load_oauth_token().is_some()
    }

    fn check(&self) -> Result<UsageSnapshot, UsageError> {
        // The token can disappear mid-run (logout, rotated file).
        // Report an idle reading rather than an error so the loop is
        // never held hostage by missing credentials.
        let Some(token) = load_oauth_token() else {
            return Ok(UsageSnapshot {
                utilization: 0.0,
                resets_at: None,
            });
        };

        let response = self
            .client
            .get(USAGE_URL)
            .bearer_auth(&token)
            .header("anthropic-beta", OAUTH_BETA)
            .header("Content-Type", "application/json")
            .send()?;

        if !response.status().is_success() {
            return Err(UsageError::Http(response.status().as_u16()));
        }

        let body: Value = response.json()?;
        Ok(snapshot_from_windows(&body))
    }
}

/// Take the maximum utilization across the five-hour and seven-day
/// windows, carrying the reset time of whichever window won.
fn snapshot_from_windows(body: &Value) -> UsageSnapshot {
    let mut utilization = 0.0;
    let mut resets_at = None;
    for window in ["five_hour", "seven_day"] {
        let Some(info) = body.get(window) else { continue };
        let Some(value) = info.get("utilization").and_then(Value::as_f64) else {
            continue;
        };
        if value > utilization {
            utilization = value;
            resets_at = info
                .get("resets_at")
                .and_then(Value::as_str)
                .and_then(parse_reset_time);
        }
    }
    UsageSnapshot {
        utilization,
        resets_at,
    }
}

fn parse_reset_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Codex session event logs under ~/.codex/sessions/.
pub struct CodexSessionScan {
    sessions_dir: PathBuf,
}

impl CodexSessionScan {
    pub fn new() -> Self {
        let sessions_dir = dirs::home_dir()
            .map(|home| home.join(".codex").join("sessions"))
            .unwrap_or_else(|| PathBuf::from(".codex/sessions"));
        Self { sessions_dir }
    }

    pub fn with_dir(sessions_dir: PathBuf) -> Self {
        Self { sessions_dir }
    }

    /// Newest rollout file by modification time.
    fn latest_session_file(&self) -> Result<Option<PathBuf>, UsageError> {
        let pattern = format!("{}/**/rollout-*.jsonl", self.sessions_dir.display());
        let entries = glob::glob(&pattern).map_err(|e| UsageError::Malformed(e.to_string()))?;

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries {
            let Ok(path) = entry else { continue };
            let Ok(meta) = fs::metadata(&path) else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            if newest.as_ref().is_none_or(|(t, _)| mtime > *t) {
                newest = Some((mtime, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}

impl Default for CodexSessionScan {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSource for CodexSessionScan {
    // Session files appear as soon as codex runs; nothing to verify
    // up front.
    fn available(&self) -> bool {
        true
    }

    fn check(&self) -> Result<UsageSnapshot, UsageError> {
        let Some(latest) = self.latest_session_file()? else {
            return Ok(UsageSnapshot {
                utilization: 0.0,
                resets_at: None,
            });
        };

        let content = fs::read_to_string(&latest)?;
        let mut last_token_event: Option<Value> = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(obj) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if let Some(payload) = obj.get("payload") {
                if payload.get("type").and_then(Value::as_str) == Some("token_count") {
                    last_token_event = Some(payload.clone());
                }
            }
        }

        let Some(payload) = last_token_event else {
            return Ok(UsageSnapshot {
                utilization: 0.0,
                resets_at: None,
            });
        };

        let primary = payload.get("rate_limits").and_then(|r| r.get("primary"));
        let utilization = primary
            .and_then(|p| p.get("used_percent"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let resets_at = primary
            .and_then(|p| p.get("resets_at"))
            .and_then(Value::as_f64)
            .and_then(|epoch| DateTime::from_timestamp(epoch as i64, 0));

        Ok(UsageSnapshot {
            utilization,
            resets_at,
        })
    }
}
