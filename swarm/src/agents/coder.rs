//! Coding stage.

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::types::{CoderSummary, Plan, Role};
use crate::io::artifacts::{RoundPaths, write_coder};
use crate::io::prompt::PromptContext;

use super::AgentSession;

/// Hand the plan to the coder and collect its summary of the edits.
#[instrument(skip_all, fields(round = ctx.round, stage = "coding"))]
pub fn run_coder(
    session: &AgentSession<'_>,
    ctx: &PromptContext<'_>,
    round: &RoundPaths,
    plan: &Plan,
) -> Result<CoderSummary> {
    let prompt = session.prompts().coder(ctx, plan)?;
    let raw = session.call(Role::Coder, round, prompt, None)?;
    let summary = CoderSummary::new(raw);
    write_coder(round, &summary)?;
    info!("coder finished");
    Ok(summary)
}
