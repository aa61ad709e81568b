//! Planner, coder and reviewer stages.
//!
//! Each stage renders its prompt, calls the agent through the retry wrapper,
//! keeps the raw reply as an artifact and turns it into a typed record.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::core::types::Role;
use crate::io::artifacts::{RoundPaths, RunPaths};
use crate::io::config::SwarmConfig;
use crate::io::invoker::{AgentInvoker, AgentRequest, classify_agent_error};
use crate::io::prompt::PromptBuilder;
use crate::retry::{RetryPolicy, retry_with_backoff};

pub mod coder;
pub mod planner;
pub mod reviewer;

/// Shared state for every agent call of one run.
pub struct AgentSession<'a> {
    invoker: &'a dyn AgentInvoker,
    prompts: PromptBuilder,
    run: RunPaths,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl<'a> AgentSession<'a> {
    pub fn new(
        invoker: &'a dyn AgentInvoker,
        config: &SwarmConfig,
        run: RunPaths,
        workdir: PathBuf,
        cancel: CancelToken,
    ) -> Result<Self> {
        Ok(Self {
            invoker,
            prompts: PromptBuilder::new(config.agent.prompt_budget_bytes)?,
            run,
            workdir,
            timeout: config.agent.timeout(),
            output_limit_bytes: config.agent.output_limit_bytes,
            retry: config.retry.policy(),
            cancel,
        })
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    pub fn run_paths(&self) -> &RunPaths {
        &self.run
    }

    /// Invoke `role` with `prompt`, retrying transient failures.
    ///
    /// The reply is written to the round's reply artifact before it is parsed.
    pub(crate) fn call(
        &self,
        role: Role,
        round: &RoundPaths,
        prompt: String,
        output_schema_path: Option<PathBuf>,
    ) -> Result<String> {
        fs::create_dir_all(&round.dir)
            .with_context(|| format!("create round dir {}", round.dir.display()))?;
        let request = AgentRequest {
            role,
            workdir: self.workdir.clone(),
            prompt,
            output_schema_path,
            output_path: round.reply_path(role),
            log_path: round.log_path(role),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        };

        let label = format!("{role} agent");
        let reply = retry_with_backoff(&label, &self.retry, &self.cancel, classify_agent_error, |attempt| {
            debug!(%role, attempt, "invoking agent");
            self.invoker.invoke(&request)
        })?;
        info!(%role, attempts = reply.attempts, "agent replied");

        fs::write(&request.output_path, &reply.value)
            .with_context(|| format!("write agent reply {}", request.output_path.display()))?;
        Ok(reply.value)
    }
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::path::Path;

    use super::*;
    use crate::io::artifacts::create_run;
    use crate::settings::RunSettings;
    use crate::test_support::settings_for;

    pub fn session<'a>(
        invoker: &'a dyn AgentInvoker,
        workspace: &Path,
    ) -> (RunSettings, AgentSession<'a>) {
        let settings = settings_for(workspace, "Add a function returning 2", 3);
        let run = create_run(workspace).expect("run dir");
        let session = AgentSession::new(
            invoker,
            &settings.config,
            run,
            workspace.to_path_buf(),
            CancelToken::new(),
        )
        .expect("session");
        (settings, session)
    }
}
