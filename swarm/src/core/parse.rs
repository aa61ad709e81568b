//! Validation of planner and reviewer replies.
//!
//! Agent replies are untrusted text. Each parser validates the reply against
//! the same JSON Schema the agent was asked to follow, then deserializes it.
//! Nothing here returns an error: a reply that fails validation degrades to a
//! conservative fallback record so the loop always has a next action.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{Plan, Review, Verdict};

pub const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
pub const REVIEW_SCHEMA: &str = include_str!("../../schemas/review.schema.json");

/// Feedback handed to the planner when the reviewer's verdict is unreadable.
pub const CLARIFY_FEEDBACK: &str = "could not parse review; please clarify pass/fail";

const EMPTY_PLAN_STEP: &str = "Planner returned no output.";
const UNPARSED_REVIEW_SUMMARY: &str = "Reviewer reply could not be parsed.";

static PLAN_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(PLAN_SCHEMA));
static REVIEW_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(REVIEW_SCHEMA));

fn compile(schema: &str) -> Validator {
    let schema: Value = serde_json::from_str(schema).expect("bundled schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("bundled schema compiles")
}

#[derive(Debug, Deserialize)]
struct PlanReply {
    steps: Vec<String>,
    files: Vec<String>,
    complete: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum ReviewStatus {
    Pass,
    Fail,
}

#[derive(Debug, Deserialize)]
struct ReviewReply {
    status: ReviewStatus,
    summary: String,
    issues: Vec<String>,
}

/// Parse a planner reply, falling back to an opaque single-step plan.
///
/// The fallback is never marked complete and always has one non-empty step.
pub fn parse_plan(raw: &str) -> Plan {
    let reply = decode::<PlanReply>(raw, &PLAN_VALIDATOR).and_then(|reply| {
        let steps: Vec<String> = reply
            .steps
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if steps.is_empty() {
            return Err("plan has only blank steps".to_string());
        }
        Ok((steps, reply))
    });
    match reply {
        Ok((steps, reply)) => Plan {
            steps,
            files: reply
                .files
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            complete: reply.complete,
        },
        Err(reason) => {
            warn!(reason = %reason, "planner reply failed validation; using raw text as plan");
            fallback_plan(raw)
        }
    }
}

/// Parse a reviewer reply, falling back to an `Unknown` verdict.
pub fn parse_review(raw: &str) -> Review {
    match decode::<ReviewReply>(raw, &REVIEW_VALIDATOR) {
        Ok(reply) => {
            let verdict = match reply.status {
                ReviewStatus::Pass => Verdict::Pass,
                ReviewStatus::Fail => Verdict::Fail,
            };
            let issues: Vec<String> = reply
                .issues
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect();
            let summary = reply.summary.trim().to_string();
            let feedback = planner_feedback(verdict, &summary, &issues);
            Review {
                verdict,
                summary,
                issues,
                feedback,
                raw: None,
            }
        }
        Err(reason) => {
            warn!(reason = %reason, "reviewer reply failed validation; verdict unknown");
            fallback_review(raw)
        }
    }
}

/// Conservative plan built from an unreadable planner reply.
pub fn fallback_plan(raw: &str) -> Plan {
    let text = raw.trim();
    let step = if text.is_empty() {
        EMPTY_PLAN_STEP.to_string()
    } else {
        text.to_string()
    };
    Plan {
        steps: vec![step],
        files: BTreeSet::new(),
        complete: false,
    }
}

/// `Unknown` review built from an unreadable or missing reviewer reply.
pub fn fallback_review(raw: &str) -> Review {
    let text = raw.trim();
    Review {
        verdict: Verdict::Unknown,
        summary: UNPARSED_REVIEW_SUMMARY.to_string(),
        issues: Vec::new(),
        feedback: CLARIFY_FEEDBACK.to_string(),
        raw: (!text.is_empty()).then(|| text.to_string()),
    }
}

fn planner_feedback(verdict: Verdict, summary: &str, issues: &[String]) -> String {
    let mut buf = format!(
        "Reviewer summary: {summary}\nStatus: {}\n",
        verdict.label()
    );
    if !issues.is_empty() {
        buf.push_str("Outstanding issues:\n");
        for issue in issues {
            buf.push_str(&format!("- {issue}\n"));
        }
    }
    buf
}

/// Strict decode: JSON syntax, then schema, then typed deserialization.
fn decode<T: DeserializeOwned>(raw: &str, validator: &Validator) -> Result<T, String> {
    let body = strip_code_fence(raw);
    if body.is_empty() {
        return Err("empty reply".to_string());
    }
    let value: Value = serde_json::from_str(body).map_err(|err| format!("invalid json: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!("schema violations: {}", messages.join("; ")));
    }
    debug!("agent reply passed schema validation");
    serde_json::from_value(value).map_err(|err| format!("unexpected shape: {err}"))
}

/// Remove surrounding whitespace and one enclosing markdown code fence.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening fence line.
    match body.split_once('\n') {
        Some((_, inner)) => inner.trim(),
        None => body.trim(),
    }
}
