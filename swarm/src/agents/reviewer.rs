//! Review stage.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::parse::parse_review;
use crate::core::types::{CoderSummary, Plan, Review, Role, TestResult, Verdict};
use crate::io::artifacts::{RoundPaths, write_review};
use crate::io::prompt::PromptContext;

use super::AgentSession;

/// Ask the reviewer to judge the round. Unreadable replies yield `Verdict::Unknown`.
#[instrument(skip_all, fields(round = ctx.round, stage = "reviewing"))]
pub fn run_reviewer(
    session: &AgentSession<'_>,
    ctx: &PromptContext<'_>,
    round: &RoundPaths,
    plan: &Plan,
    coder: &CoderSummary,
    tests: &TestResult,
) -> Result<Review> {
    let prompt = session.prompts().reviewer(ctx, plan, coder, tests)?;
    let schema = session.run_paths().review_schema_path.clone();
    let raw = session.call(Role::Reviewer, round, prompt, Some(schema))?;
    let review = parse_review(&raw);
    write_review(round, &review)?;
    if review.verdict == Verdict::Unknown {
        warn!("review verdict unknown; asking planner to clarify");
    }
    info!(verdict = review.verdict.label(), issues = review.issues.len(), "review ready");
    Ok(review)
}
