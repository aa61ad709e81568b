//! Shared deterministic types for the iteration loop.
//!
//! These records are produced once per round and never mutated afterwards. They
//! carry no I/O handles so reports can be serialized and replayed.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Agent roles that take part in a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Coder,
    Reviewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Coder => "coder",
            Role::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stages of a round, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Planning,
    Coding,
    Testing,
    Reviewing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Coding => "coding",
            Stage::Testing => "testing",
            Stage::Reviewing => "reviewing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Planner output for one round.
///
/// `complete` is the planner's own claim and is only reported; it never ends
/// the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
    pub files: BTreeSet<String>,
    pub complete: bool,
}

impl Plan {
    /// Numbered rendering used in prompts and reports.
    pub fn summary(&self) -> String {
        let mut buf = String::new();
        for (idx, step) in self.steps.iter().enumerate() {
            buf.push_str(&format!("{}. {}\n", idx + 1, step.trim()));
        }
        if !self.files.is_empty() {
            buf.push_str("\nFiles:\n");
            for file in &self.files {
                buf.push_str(&format!("- {file}\n"));
            }
        }
        buf.push_str(&format!(
            "\nPlanner marked complete: {}\n",
            if self.complete { "yes" } else { "no" }
        ));
        buf
    }
}

/// Free-text description of the edits the coder made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoderSummary(String);

impl CoderSummary {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self("Coder returned no summary.".to_string());
        }
        Self(trimmed.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of running the project's test command once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Command line as it was spawned.
    pub command: String,
    /// Exit code, `None` when the process was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub passed: bool,
    pub timed_out: bool,
    /// Condensed combined output handed to the reviewer.
    pub output: String,
    /// Bytes dropped from the output by capture limits and condensing.
    pub elided_bytes: usize,
}

impl TestResult {
    pub fn status_label(&self) -> String {
        if self.passed {
            return "PASS".to_string();
        }
        if self.timed_out {
            return "FAIL (timed out)".to_string();
        }
        match self.exit_code {
            Some(code) => format!("FAIL (exit {code})"),
            None => "FAIL (terminated by signal)".to_string(),
        }
    }

    /// Text block handed to the reviewer and printed in reports.
    pub fn summary(&self) -> String {
        let output = self.output.trim();
        let output = if output.is_empty() {
            "<no output>"
        } else {
            output
        };
        format!(
            "Command: {}\nStatus: {}\nOutput:\n{}\n",
            self.command,
            self.status_label(),
            output
        )
    }
}

/// Reviewer's judgement of a round.
///
/// `Unknown` means the reply could not be read as a verdict. It is neither a
/// pass nor a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    Unknown,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Unknown => "UNKNOWN",
        }
    }
}

/// Reviewer output for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub verdict: Verdict,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    /// Text handed to the planner in the next round.
    pub feedback: String,
    /// Raw reviewer reply, kept only when it could not be parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl Review {
    pub fn summary_text(&self) -> String {
        let mut buf = format!(
            "Status: {}\nSummary: {}\n",
            self.verdict.label(),
            self.summary.trim()
        );
        if !self.issues.is_empty() {
            buf.push_str("Issues:\n");
            for issue in &self.issues {
                buf.push_str(&format!("- {}\n", issue.trim()));
            }
        }
        if let Some(raw) = self.raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            buf.push_str(&format!("Raw reply:\n{raw}\n"));
        }
        buf
    }
}

/// Immutable snapshot of one completed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    /// Round index (1-indexed, strictly increasing).
    pub round: u32,
    pub plan: Plan,
    pub coder: CoderSummary,
    pub tests: TestResult,
    pub review: Review,
    pub duration_ms: u64,
}

/// Why a round could not finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundFailure {
    pub round: u32,
    pub stage: Stage,
    pub cause: String,
    /// The run was stopped from outside rather than by a failing stage.
    pub cancelled: bool,
}

/// How a run ended. Exactly one is reached per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Termination {
    /// The reviewer accepted the work in `round`.
    Complete { round: u32 },
    /// `max_iterations` rounds ran without a passing review.
    LimitReached { max_iterations: u32 },
    /// A stage failed or the run was cancelled.
    Fatal(RoundFailure),
}

impl Termination {
    pub fn label(&self) -> &'static str {
        match self {
            Termination::Complete { .. } => "COMPLETE",
            Termination::LimitReached { .. } => "LIMIT_REACHED",
            Termination::Fatal(_) => "FATAL",
        }
    }
}

/// Full history of a run, returned on every termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub goal: String,
    pub workspace: PathBuf,
    pub max_iterations: u32,
    pub iterations: Vec<IterationResult>,
    pub termination: Termination,
}

impl WorkflowResult {
    pub fn success(&self) -> bool {
        matches!(self.termination, Termination::Complete { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_result(passed: bool, exit_code: Option<i32>, timed_out: bool) -> TestResult {
        TestResult {
            command: "pytest -q".to_string(),
            exit_code,
            passed,
            timed_out,
            output: String::new(),
            elided_bytes: 0,
        }
    }

    #[test]
    fn plan_summary_numbers_steps_and_lists_files() {
        let plan = Plan {
            steps: vec!["write add()".to_string(), "test add()".to_string()],
            files: BTreeSet::from(["tests/test_add.py".to_string(), "src/add.py".to_string()]),
            complete: false,
        };

        let summary = plan.summary();
        assert!(summary.starts_with("1. write add()\n2. test add()\n"));
        let src = summary.find("- src/add.py").expect("src listed");
        let tests = summary.find("- tests/test_add.py").expect("tests listed");
        assert!(src < tests, "files listed in sorted order");
        assert!(summary.contains("Planner marked complete: no"));
    }

    #[test]
    fn coder_summary_substitutes_placeholder_for_blank_text() {
        assert_eq!(
            CoderSummary::new("  \n").as_str(),
            "Coder returned no summary."
        );
        assert_eq!(CoderSummary::new(" edited src ").as_str(), "edited src");
    }

    #[test]
    fn test_status_labels_cover_every_outcome() {
        assert_eq!(test_result(true, Some(0), false).status_label(), "PASS");
        assert_eq!(
            test_result(false, Some(1), false).status_label(),
            "FAIL (exit 1)"
        );
        assert_eq!(
            test_result(false, None, true).status_label(),
            "FAIL (timed out)"
        );
        assert_eq!(
            test_result(false, None, false).status_label(),
            "FAIL (terminated by signal)"
        );
    }

    #[test]
    fn termination_serializes_with_state_tag() {
        let json = serde_json::to_value(Termination::LimitReached { max_iterations: 2 })
            .expect("serialize");
        assert_eq!(json["state"], "limit_reached");
        assert_eq!(json["max_iterations"], 2);

        let fatal = Termination::Fatal(RoundFailure {
            round: 1,
            stage: Stage::Testing,
            cause: "spawn pytest".to_string(),
            cancelled: false,
        });
        let json = serde_json::to_value(&fatal).expect("serialize");
        assert_eq!(json["state"], "fatal");
        assert_eq!(json["stage"], "testing");
        let back: Termination = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, fatal);
    }
}
