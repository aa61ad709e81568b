//! Agent invocation boundary.
//!
//! The [`AgentInvoker`] trait decouples the loop from the agent backend
//! (currently `codex exec`). Tests use scripted invokers that return canned
//! replies without spawning processes.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::condense::suffix_within;
use crate::core::types::Role;
use crate::io::config::{AgentConfig, RetryConfig};
use crate::io::process::{CommandOutput, run_command_with_stream};
use crate::retry::RetryDecision;

/// Bytes of failed agent output quoted in an [`AgentCallError`].
const ERROR_TAIL_BYTES: usize = 2_000;

/// Trailing stderr lines checked against the retryable patterns.
const ERROR_LINES: usize = 5;

/// Parameters for one agent call.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: Role,
    /// Working directory for the agent process (the workspace).
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// JSON Schema constraining the final message, when the role has one.
    pub output_schema_path: Option<PathBuf>,
    /// Where the agent writes its final message.
    pub output_path: PathBuf,
    /// Invocation log (agent stdout/stderr).
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over agent backends.
pub trait AgentInvoker {
    /// Run the agent and return its final message as raw text.
    fn invoke(&self, request: &AgentRequest) -> Result<String>;
}

/// Failed agent call that the retry classifier can inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCallError {
    pub role: Role,
    /// Transient failure (rate limit, overload) worth retrying.
    pub retryable: bool,
    pub message: String,
}

impl fmt::Display for AgentCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.retryable { "transient" } else { "fatal" };
        write!(f, "{} agent call failed ({kind}): {}", self.role, self.message)
    }
}

impl std::error::Error for AgentCallError {}

/// Retry classifier for agent calls: only errors tagged retryable are retried.
pub fn classify_agent_error(err: &anyhow::Error) -> RetryDecision {
    match err.downcast_ref::<AgentCallError>() {
        Some(call) if call.retryable => RetryDecision::Retry,
        _ => RetryDecision::Fail,
    }
}

/// Invoker that spawns `codex exec` non-interactively.
///
/// Planner and reviewer run in a read-only sandbox; the coder may write the
/// workspace.
pub struct CodexInvoker {
    program: String,
    extra_args: Vec<String>,
    retryable_patterns: Vec<Regex>,
    cancel: CancelToken,
}

impl CodexInvoker {
    pub fn new(agent: &AgentConfig, retry: &RetryConfig, cancel: CancelToken) -> Result<Self> {
        Ok(Self {
            program: agent.program.clone(),
            extra_args: agent.extra_args.clone(),
            retryable_patterns: retry.compile_patterns()?,
            cancel,
        })
    }

    fn sandbox(role: Role) -> &'static str {
        match role {
            Role::Coder => "workspace-write",
            Role::Planner | Role::Reviewer => "read-only",
        }
    }

    /// Whether the failure reads as rate limiting or overload.
    ///
    /// Only the last stderr lines are checked, skipping lines that echo the
    /// prompt, so a goal that mentions "rate limits" cannot make a fatal
    /// error look transient.
    fn is_transient(&self, stderr: &str, prompt: &str) -> bool {
        let lines = error_lines(stderr, prompt);
        self.retryable_patterns
            .iter()
            .any(|re| lines.iter().any(|line| re.is_match(line)))
    }

    fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("exec")
            .args(&self.extra_args)
            .arg("--sandbox")
            .arg(Self::sandbox(request.role))
            // Workspaces are often not git repositories yet.
            .arg("--skip-git-repo-check");
        if let Some(schema) = &request.output_schema_path {
            cmd.arg("--output-schema").arg(schema);
        }
        cmd.arg("--output-last-message")
            .arg(&request.output_path)
            .arg("-")
            .current_dir(&request.workdir);
        cmd
    }
}

impl AgentInvoker for CodexInvoker {
    #[instrument(skip_all, fields(role = %request.role, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &AgentRequest) -> Result<String> {
        info!(workdir = %request.workdir.display(), "starting agent");
        debug!(prompt = %request.prompt, "agent prompt");

        if let Some(schema) = &request.output_schema_path
            && !schema.exists()
        {
            return Err(anyhow!("missing output schema {}", schema.display()));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        if request.output_path.exists() {
            fs::remove_file(&request.output_path).with_context(|| {
                format!("remove stale agent output {}", request.output_path.display())
            })?;
        }

        let output = run_command_with_stream(
            self.command(request),
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            &request.log_path,
            &self.cancel,
        )
        .with_context(|| format!("run {} agent ({})", request.role, self.program))?;

        append_stderr_log(&request.log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(AgentCallError {
                role: request.role,
                retryable: false,
                message: format!("timed out after {}s", request.timeout.as_secs()),
            }
            .into());
        }
        if !output.status.success() {
            let combined = output.combined();
            let stderr = String::from_utf8_lossy(&output.stderr);
            let retryable = self.is_transient(&stderr, &request.prompt);
            warn!(exit_code = ?output.status.code(), retryable, "agent exited with failure");
            return Err(AgentCallError {
                role: request.role,
                retryable,
                message: format!(
                    "exit status {:?}: {}",
                    output.status.code(),
                    suffix_within(combined.trim(), ERROR_TAIL_BYTES)
                ),
            }
            .into());
        }

        let reply = fs::read_to_string(&request.output_path).map_err(|err| AgentCallError {
            role: request.role,
            retryable: false,
            message: format!(
                "no final message at {}: {err}",
                request.output_path.display()
            ),
        })?;
        debug!(reply = %reply, "agent reply");
        Ok(reply)
    }
}

/// Last non-empty stderr lines that are not part of the prompt, in order.
fn error_lines<'a>(stderr: &'a str, prompt: &str) -> Vec<&'a str> {
    let mut lines: Vec<&str> = stderr
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !prompt.contains(line))
        .take(ERROR_LINES)
        .collect();
    lines.reverse();
    lines
}

fn append_stderr_log(path: &Path, output: &CommandOutput) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open agent log {}", path.display()))?;
    let mut buf = String::from("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.truncated_bytes() > 0 {
        buf.push_str(&format!(
            "\n[agent output truncated {} bytes]\n",
            output.truncated_bytes()
        ));
    }
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    file.write_all(buf.as_bytes())
        .with_context(|| format!("write agent log {}", path.display()))
}
