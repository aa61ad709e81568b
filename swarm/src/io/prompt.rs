//! Prompt packs for the planner, coder and reviewer agents.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::condense::{condense_output, prefix_within};
use crate::core::types::{CoderSummary, Plan, Role, TestResult};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const CODER_TEMPLATE: &str = include_str!("prompts/coder.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

/// Droppable sections, least important first.
const TRIM_ORDER: [&str; 3] = ["coder", "feedback", "tests"];

/// A trimmed section smaller than this is dropped instead.
const MIN_SECTION_BYTES: usize = 256;

/// Room left for the elision marker inserted by `condense_output`.
const MARKER_BYTES: usize = 64;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(Role::Planner.as_str(), PLANNER_TEMPLATE)
            .context("planner template")?;
        env.add_template(Role::Coder.as_str(), CODER_TEMPLATE)
            .context("coder template")?;
        env.add_template(Role::Reviewer.as_str(), REVIEWER_TEMPLATE)
            .context("reviewer template")?;
        Ok(Self { env })
    }

    fn render(&self, role: Role, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(role.as_str())?;
        template
            .render(ctx)
            .with_context(|| format!("render {role} prompt"))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Result<Vec<ParsedSection>> {
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(matches.len());

    for (i, caps) in matches.iter().enumerate() {
        let (Some(marker), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            return Err(anyhow!("malformed section marker"));
        };
        let end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());

        let content = rendered[marker.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    Ok(sections)
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Shrink droppable sections in [`TRIM_ORDER`] until the prompt fits `budget`.
///
/// A section is condensed (head and tail kept) when enough of it survives,
/// otherwise dropped. If required sections alone exceed the budget the last
/// section is cut.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in TRIM_ORDER {
        let total = total_len(sections);
        if total <= budget {
            return;
        }
        let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) else {
            continue;
        };
        let overflow = total - budget;
        let len = sections[idx].content.len();
        let keep = len.saturating_sub(overflow + MARKER_BYTES);
        if keep < MIN_SECTION_BYTES {
            debug!(section = key, bytes_dropped = len, "dropped section for budget");
            sections.remove(idx);
        } else {
            let condensed = condense_output(&sections[idx].content, keep);
            debug!(
                section = key,
                bytes_elided = condensed.elided_bytes,
                "condensed section for budget"
            );
            sections[idx].content = condensed.text;
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    if let Some(last) = sections.last_mut() {
        let allowed = last.content.len().saturating_sub(total - budget);
        let before_len = last.content.len();
        last.content = format!("{}\n[truncated]", prefix_within(&last.content, allowed));
        debug!(section = %last.key, before_len, after_len = last.content.len(), "truncated section for budget");
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Inputs shared by every prompt of a run.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub goal: &'a str,
    pub workspace: &'a str,
    pub test_command: &'a str,
    pub round: u32,
    pub max_iterations: u32,
}

/// Builds prompts within a byte budget, trimming less critical sections first.
pub struct PromptBuilder {
    engine: PromptEngine,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        Ok(Self {
            engine: PromptEngine::new()?,
            budget_bytes,
        })
    }

    pub fn planner(&self, ctx: &PromptContext<'_>, feedback: Option<&str>) -> Result<String> {
        self.build(
            Role::Planner,
            context! {
                goal => ctx.goal.trim(),
                workspace => ctx.workspace,
                round => ctx.round,
                max_iterations => ctx.max_iterations,
                feedback => feedback.map(str::trim).filter(|s| !s.is_empty()),
            },
        )
    }

    pub fn coder(&self, ctx: &PromptContext<'_>, plan: &Plan) -> Result<String> {
        let plan = plan.summary();
        self.build(
            Role::Coder,
            context! {
                goal => ctx.goal.trim(),
                workspace => ctx.workspace,
                test_command => ctx.test_command,
                plan => plan.trim(),
            },
        )
    }

    pub fn reviewer(
        &self,
        ctx: &PromptContext<'_>,
        plan: &Plan,
        coder: &CoderSummary,
        tests: &TestResult,
    ) -> Result<String> {
        let plan = plan.summary();
        let tests = tests.summary();
        self.build(
            Role::Reviewer,
            context! {
                goal => ctx.goal.trim(),
                workspace => ctx.workspace,
                plan => plan.trim(),
                coder => coder.as_str(),
                tests => tests.trim(),
            },
        )
    }

    fn build(&self, role: Role, ctx: minijinja::Value) -> Result<String> {
        let rendered = self.engine.render(role, ctx)?;
        let mut sections = parse_sections(&rendered)?;
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn ctx() -> PromptContext<'static> {
        PromptContext {
            goal: "Add a function returning 2",
            workspace: "/tmp/ws",
            test_command: "pytest -q",
            round: 2,
            max_iterations: 3,
        }
    }

    fn plan() -> Plan {
        Plan {
            steps: vec!["Create src/two.py".to_string()],
            files: BTreeSet::from(["src/two.py".to_string()]),
            complete: true,
        }
    }

    fn tests_result(output: String) -> TestResult {
        TestResult {
            command: "pytest -q".to_string(),
            exit_code: Some(1),
            passed: false,
            timed_out: false,
            output,
            elided_bytes: 0,
        }
    }

    #[test]
    fn planner_prompt_includes_feedback_only_when_present() {
        let builder = PromptBuilder::new(40_000).expect("builder");
        let first = builder.planner(&ctx(), None).expect("render");
        assert!(first.contains("### Planner Contract"));
        assert!(first.contains("<goal>\nAdd a function returning 2\n</goal>"));
        assert!(!first.contains("Reviewer Feedback"));

        let second = builder
            .planner(&ctx(), Some("Status: FAIL\n- missing test"))
            .expect("render");
        let goal_pos = second.find("### Goal").expect("goal");
        let feedback_pos = second.find("### Reviewer Feedback").expect("feedback");
        assert!(goal_pos < feedback_pos);
        assert!(second.contains("- missing test"));
    }

    #[test]
    fn coder_prompt_carries_plan_and_test_command() {
        let builder = PromptBuilder::new(40_000).expect("builder");
        let prompt = builder.coder(&ctx(), &plan()).expect("render");
        assert!(prompt.contains("1. Create src/two.py"));
        assert!(prompt.contains("`pytest -q`"));
        assert!(prompt.contains("/tmp/ws"));
    }

    #[test]
    fn reviewer_sections_are_ordered() {
        let builder = PromptBuilder::new(40_000).expect("builder");
        let prompt = builder
            .reviewer(
                &ctx(),
                &plan(),
                &CoderSummary::new("wrote two()"),
                &tests_result("1 failed".to_string()),
            )
            .expect("render");
        let order = [
            "### Reviewer Contract",
            "### Goal",
            "### Plan",
            "### Coder Summary",
            "### Test Results",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|h| prompt.find(h).expect("section present"))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.contains("Status: FAIL (exit 1)"));
    }

    #[test]
    fn budget_trims_coder_before_tests_and_keeps_required() {
        let builder = PromptBuilder::new(3_000).expect("builder");
        let output = format!("{}\n== 1 failed in 0.1s ==", "E".repeat(5_000));
        let prompt = builder
            .reviewer(
                &ctx(),
                &plan(),
                &CoderSummary::new("c".repeat(4_000)),
                &tests_result(output),
            )
            .expect("render");

        assert!(prompt.len() <= 3_100, "prompt is {} bytes", prompt.len());
        assert!(prompt.contains("### Reviewer Contract"));
        assert!(prompt.contains("Add a function returning 2"));
        assert!(!prompt.contains("### Coder Summary"), "coder dropped first");
        assert!(prompt.contains("== 1 failed in 0.1s =="), "test tail kept");
    }

    #[test]
    fn parse_sections_skips_empty_droppable_sections() {
        let rendered = "<!-- section:a required -->\nA\n<!-- section:b droppable -->\n\n<!-- section:c required -->\n";
        let sections = parse_sections(rendered).expect("parse");
        let keys: Vec<&str> = sections.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }
}
