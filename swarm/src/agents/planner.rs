//! Planning stage.

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::parse::parse_plan;
use crate::core::types::{Plan, Role};
use crate::io::artifacts::{RoundPaths, write_plan};
use crate::io::prompt::PromptContext;

use super::AgentSession;

/// Ask the planner for a plan, threading the previous round's feedback.
///
/// An unreadable reply degrades to a fallback plan; only invocation and
/// artifact failures are errors.
#[instrument(skip_all, fields(round = ctx.round, stage = "planning"))]
pub fn run_planner(
    session: &AgentSession<'_>,
    ctx: &PromptContext<'_>,
    round: &RoundPaths,
    feedback: Option<&str>,
) -> Result<Plan> {
    let prompt = session.prompts().planner(ctx, feedback)?;
    let schema = session.run_paths().plan_schema_path.clone();
    let raw = session.call(Role::Planner, round, prompt, Some(schema))?;
    let plan = parse_plan(&raw);
    write_plan(round, &plan)?;
    info!(steps = plan.steps.len(), complete = plan.complete, "plan ready");
    Ok(plan)
}
