//! Test execution adapter.
//!
//! Runs the project's test command inside the workspace. A failing or
//! timed-out suite is an ordinary [`TestResult`]; only an unusable workspace
//! or an uninvokable command is an error.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::condense::condense_output;
use crate::core::types::TestResult;
use crate::io::config::TestsConfig;
use crate::io::process::run_command_with_timeout;

/// Parameters for one test run.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub timeout: Duration,
    /// In-memory cap per output stream.
    pub output_limit_bytes: usize,
    /// Size of the condensed output kept in the result.
    pub summary_limit_bytes: usize,
}

impl TestRequest {
    pub fn from_config(workdir: PathBuf, cfg: &TestsConfig) -> Self {
        Self {
            workdir,
            command: cfg.command.clone(),
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
            summary_limit_bytes: cfg.summary_limit_bytes,
        }
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Abstraction over test execution.
pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestResult>;
}

/// Runs the configured test command as a child process.
pub struct CommandTestRunner {
    cancel: CancelToken,
}

impl CommandTestRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(command = %request.command_line(), timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &TestRequest) -> Result<TestResult> {
        if !request.workdir.is_dir() {
            return Err(anyhow!(
                "workspace {} is not a directory",
                request.workdir.display()
            ));
        }
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("test command is empty"))?;

        info!("running tests");
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
            &self.cancel,
        )
        .with_context(|| format!("run test command `{}`", request.command_line()))?;

        let mut text = output.combined();
        if output.timed_out {
            text.push_str(&format!(
                "\n[test command timed out after {}s]\n",
                request.timeout.as_secs()
            ));
        }
        debug!(output = %text, "full test output");
        let condensed = condense_output(&text, request.summary_limit_bytes);

        let passed = output.status.success() && !output.timed_out;
        if passed {
            info!("tests passed");
        } else {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "tests failed");
        }

        Ok(TestResult {
            command: request.command_line(),
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            passed,
            timed_out: output.timed_out,
            output: condensed.text,
            elided_bytes: condensed.elided_bytes + output.truncated_bytes(),
        })
    }
}
