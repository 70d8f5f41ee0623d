//! Agent CLI invocation building
//!
//! Turns a prompt plus continuation state into a concrete command line
//! for the selected provider. The rest of the crate treats the result
//! as opaque: it only ever sees captured output, an exit code, and an
//! elapsed time.

use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::process::Command;

/// Instruction block prepended to every prompt. Tells the agent to
/// never ask for input and to emit the DONE marker when finished.
const WORKER_PREAMBLE: &str = include_str!("../prompts/worker_preamble.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
}

impl Provider {
    pub fn binary(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// One fully-built agent invocation.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentCommand {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Shell-escaped rendering for the session log's `cmd:` line.
    pub fn display_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            parts.push(shell_escape::escape(Cow::from(arg.as_str())).into_owned());
        }
        parts.join(" ")
    }
}

/// Build the invocation for one iteration.
///
/// `session_id` only applies to claude, which resumes an existing
/// session with an explicit ID so other sessions are never hijacked.
pub fn build_command(
    provider: Provider,
    prompt: &str,
    session_id: Option<&str>,
    model: Option<&str>,
) -> AgentCommand {
    let full_prompt = format!("{WORKER_PREAMBLE}\n{prompt}");

    match provider {
        Provider::Claude => {
            let mut args = vec![
                "--dangerously-skip-permissions".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
                "--verbose".to_string(),
            ];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            if let Some(sid) = session_id {
                args.push("--resume".to_string());
                args.push(sid.to_string());
            }
            args.push("-p".to_string());
            args.push(full_prompt);
            AgentCommand {
                program: "claude".to_string(),
                args,
            }
        }
        Provider::Codex => {
            let mut args = vec![
                "exec".to_string(),
                "--dangerously-bypass-approvals-and-sandbox".to_string(),
            ];
            if let Some(model) = model {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
            args.push(full_prompt);
            AgentCommand {
                program: "codex".to_string(),
                args,
            }
        }
    }
}

/// Verify the provider binary is on PATH before starting the loop.
pub fn preflight(provider: Provider) -> Result<()> {
    let binary = provider.binary();
    if which::which(binary).is_err() {
        bail!("'{binary}' not found on PATH. Install the {binary} CLI first.");
    }
    Ok(())
}
