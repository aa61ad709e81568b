//! Scripted fakes shared by unit and integration tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::cancel::{CancelToken, Cancelled};
use crate::core::types::{Role, TestResult};
use crate::io::config::{ScaffoldConfig, SwarmConfig};
use crate::io::invoker::{AgentCallError, AgentInvoker, AgentRequest};
use crate::io::test_runner::{TestRequest, TestRunner};
use crate::settings::RunSettings;

/// One canned agent behaviour.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text as the agent's final message.
    Text(String),
    /// Write `contents` to `path` (relative to the workdir), then reply with `summary`.
    Edit {
        path: String,
        contents: String,
        summary: String,
    },
    /// Fail with an [`AgentCallError`].
    Fail { retryable: bool, message: String },
    /// Fire the token, then fail as a cancelled call would.
    Cancel(CancelToken),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn plan(steps: &[&str], complete: bool) -> Self {
        Self::Text(
            serde_json::json!({ "steps": steps, "files": [], "complete": complete }).to_string(),
        )
    }

    pub fn review(status: &str, summary: &str, issues: &[&str]) -> Self {
        Self::Text(
            serde_json::json!({ "status": status, "summary": summary, "issues": issues })
                .to_string(),
        )
    }

    pub fn transient() -> Self {
        Self::Fail {
            retryable: true,
            message: "429 Too Many Requests".to_string(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fail {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Invoker that replays per-role queues and records every request.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    replies: RefCell<HashMap<Role, VecDeque<ScriptedReply>>>,
    requests: RefCell<Vec<AgentRequest>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, role: Role, reply: ScriptedReply) -> &Self {
        self.replies
            .borrow_mut()
            .entry(role)
            .or_default()
            .push_back(reply);
        self
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    pub fn requests_for(&self, role: Role) -> Vec<AgentRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.role == role)
            .cloned()
            .collect()
    }

    pub fn remaining(&self, role: Role) -> usize {
        self.replies.borrow().get(&role).map_or(0, VecDeque::len)
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(&self, request: &AgentRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        let reply = self
            .replies
            .borrow_mut()
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted reply left for {}", request.role))?;
        match reply {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Edit {
                path,
                contents,
                summary,
            } => {
                write_in(&request.workdir, &path, &contents)?;
                Ok(summary)
            }
            ScriptedReply::Fail { retryable, message } => Err(AgentCallError {
                role: request.role,
                retryable,
                message,
            }
            .into()),
            ScriptedReply::Cancel(token) => {
                token.cancel();
                Err(Cancelled.into())
            }
        }
    }
}

fn write_in(root: &Path, rel: &str, contents: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Test runner that replays canned results and counts calls.
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    results: RefCell<VecDeque<Result<TestResult, String>>>,
    calls: RefCell<Vec<TestRequest>>,
}

impl ScriptedTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pass(&self, output: &str) -> &Self {
        self.results
            .borrow_mut()
            .push_back(Ok(test_result(true, output)));
        self
    }

    pub fn push_fail(&self, output: &str) -> &Self {
        self.results
            .borrow_mut()
            .push_back(Ok(test_result(false, output)));
        self
    }

    /// Queue an infrastructure failure (e.g. the test command is missing).
    pub fn push_error(&self, message: &str) -> &Self {
        self.results.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestResult> {
        self.calls.borrow_mut().push(request.clone());
        match self.results.borrow_mut().pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(test_result(false, "no scripted test result")),
        }
    }
}

pub fn test_result(passed: bool, output: &str) -> TestResult {
    TestResult {
        command: "pytest -q".to_string(),
        exit_code: Some(if passed { 0 } else { 1 }),
        passed,
        timed_out: false,
        output: output.to_string(),
        elided_bytes: 0,
    }
}

/// Settings for a fast, offline run in `workspace`.
///
/// Retries do not sleep and the scaffold step runs no external command.
pub fn settings_for(workspace: &Path, goal: &str, max_iterations: u32) -> RunSettings {
    let mut config = SwarmConfig {
        max_iterations,
        scaffold: ScaffoldConfig {
            command: Vec::new(),
            ..ScaffoldConfig::default()
        },
        ..SwarmConfig::default()
    };
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    RunSettings {
        goal: goal.to_string(),
        workspace: workspace.to_path_buf(),
        config,
    }
}
