//! Feedback reviewer
//!
//! After a successful iteration the loop can ask an outside model to
//! review the worker's latest progress report and steer the next
//! prompt. The reviewer is strictly best-effort: any failure, missing
//! key, bad response shape, timeout, whatever, yields `None` and the
//! loop falls back to a plain `continue`.

use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::status::latest_status_file;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const OPENROUTER_MODEL: &str = "anthropic/claude-sonnet-4";
const FEEDBACK_MAX_TOKENS: u32 = 1024;
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Prompt wrapped around the worker's progress report.
const FEEDBACK_TEMPLATE: &str = include_str!("../../prompts/feedback.md");

/// Reviews the newest progress artifact in the workspace and returns
/// feedback for the next iteration, or `None` when no review could be
/// produced. Never an error: the loop must not depend on the reviewer.
pub trait FeedbackSource {
    fn review(&self, workspace: &Path) -> Option<String>;
}

/// OpenRouter chat-completions reviewer.
pub struct OpenRouterFeedback {
    client: Client,
}

impl OpenRouterFeedback {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

impl FeedbackSource for OpenRouterFeedback {
    fn review(&self, workspace: &Path) -> Option<String> {
        let api_key = load_api_key()?;

        // Prefer the worker's own markdown summary; the iteration's
        // JSON record is the fallback when it never wrote one.
        let artifact = latest_status_file(workspace)?;
        let status_content = fs::read_to_string(&artifact).ok()?;

        let prompt = FEEDBACK_TEMPLATE.replace("{status_content}", &status_content);
        let body = json!({
            "model": OPENROUTER_MODEL,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": FEEDBACK_MAX_TOKENS,
        });

        let response = self
            .client
            .post(OPENROUTER_URL)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .ok()?;
        if !response.status().is_success() {
            return None;
        }

        let payload: Value = response.json().ok()?;
        extract_feedback_text(&payload)
    }
}

/// `$OPENROUTER_API_KEY`, else an `OPENROUTER_API_KEY=` line in a
/// `.env` file in the current directory.
fn load_api_key() -> Option<String> {
    if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
        if !key.is_empty() {
            return Some(key);
        }
    }
    let content = fs::read_to_string(".env").ok()?;
    api_key_from_env_content(&content)
}

fn api_key_from_env_content(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("OPENROUTER_API_KEY="))
        .map(|value| value.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|key| !key.is_empty())
}

fn extract_feedback_text(payload: &Value) -> Option<String> {
    payload
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}
