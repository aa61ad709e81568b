//! Human-readable rendering of a [`WorkflowResult`].

use std::fmt::Write as _;

use crate::core::types::{IterationResult, Termination, WorkflowResult};
use crate::exit_codes;

const RULE: &str = "========================================";

/// Render the full run history followed by a final `RESULT:` line.
pub fn format_report(result: &WorkflowResult) -> String {
    let mut buf = String::new();
    let _ = writeln!(buf, "Run: {}", result.run_id);
    let _ = writeln!(buf, "Goal: {}", result.goal.trim());
    let _ = writeln!(buf, "Workspace: {}", result.workspace.display());
    let _ = writeln!(buf, "Max iterations: {}", result.max_iterations);

    for iteration in &result.iterations {
        buf.push('\n');
        format_iteration(&mut buf, iteration);
    }

    buf.push('\n');
    let _ = writeln!(buf, "{RULE}");
    let _ = writeln!(buf, "RESULT: {}", termination_line(&result.termination));
    buf
}

fn format_iteration(buf: &mut String, it: &IterationResult) {
    let _ = writeln!(buf, "{RULE}");
    let _ = writeln!(buf, "ITERATION {} ({} ms)", it.round, it.duration_ms);
    let _ = writeln!(buf, "{RULE}");
    section(buf, "PLAN", &it.plan.summary());
    section(buf, "CODER SUMMARY", it.coder.as_str());
    section(buf, "TEST RESULTS", &it.tests.summary());
    section(buf, "REVIEW", &it.review.summary_text());
}

fn section(buf: &mut String, title: &str, body: &str) {
    let _ = writeln!(buf, "--- {title} ---");
    let _ = writeln!(buf, "{}", body.trim_end());
    buf.push('\n');
}

fn termination_line(termination: &Termination) -> String {
    match termination {
        Termination::Complete { round } => format!("COMPLETE (reviewer passed round {round})"),
        Termination::LimitReached { max_iterations } => {
            format!("LIMIT_REACHED (no passing review after {max_iterations} round(s))")
        }
        Termination::Fatal(failure) if failure.cancelled => format!(
            "FATAL (cancelled during {} in round {})",
            failure.stage, failure.round
        ),
        Termination::Fatal(failure) => format!(
            "FATAL ({} failed in round {}: {})",
            failure.stage, failure.round, failure.cause
        ),
    }
}

/// Process exit code for a finished run.
pub fn exit_code(result: &WorkflowResult) -> i32 {
    match &result.termination {
        Termination::Complete { .. } => exit_codes::OK,
        Termination::LimitReached { .. } => exit_codes::LIMIT_REACHED,
        Termination::Fatal(failure) if failure.cancelled => exit_codes::CANCELLED,
        Termination::Fatal(_) => exit_codes::FATAL,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use super::*;
    use crate::core::types::{CoderSummary, Plan, Review, RoundFailure, Stage, Verdict};
    use crate::test_support::test_result;

    fn iteration(round: u32, verdict: Verdict) -> IterationResult {
        IterationResult {
            round,
            plan: Plan {
                steps: vec!["Create src/two.py".to_string()],
                files: BTreeSet::from(["src/two.py".to_string()]),
                complete: false,
            },
            coder: CoderSummary::new("Added two()"),
            tests: test_result(verdict == Verdict::Pass, "1 passed"),
            review: Review {
                verdict,
                summary: "checked".to_string(),
                issues: vec!["needs docstring".to_string()],
                feedback: String::new(),
                raw: None,
            },
            duration_ms: 12,
        }
    }

    fn result(iterations: Vec<IterationResult>, termination: Termination) -> WorkflowResult {
        WorkflowResult {
            run_id: "run-1".to_string(),
            goal: "Add a function returning 2".to_string(),
            workspace: PathBuf::from("/ws"),
            max_iterations: 3,
            iterations,
            termination,
        }
    }

    #[test]
    fn report_lists_every_round_in_order() {
        let report = format_report(&result(
            vec![iteration(1, Verdict::Fail), iteration(2, Verdict::Pass)],
            Termination::Complete { round: 2 },
        ));
        let first = report.find("ITERATION 1").expect("round 1");
        let second = report.find("ITERATION 2").expect("round 2");
        assert!(first < second);
        for heading in ["--- PLAN ---", "--- CODER SUMMARY ---", "--- TEST RESULTS ---", "--- REVIEW ---"] {
            assert_eq!(report.matches(heading).count(), 2, "{heading}");
        }
        assert!(report.contains("- needs docstring"));
        assert!(report.trim_end().ends_with("RESULT: COMPLETE (reviewer passed round 2)"));
    }

    #[test]
    fn fatal_report_names_stage_and_cause() {
        let failure = RoundFailure {
            round: 2,
            stage: Stage::Testing,
            cause: "spawn pytest".to_string(),
            cancelled: false,
        };
        let res = result(vec![iteration(1, Verdict::Fail)], Termination::Fatal(failure));
        let report = format_report(&res);
        assert!(report.contains("RESULT: FATAL (testing failed in round 2: spawn pytest)"));
        assert_eq!(exit_code(&res), exit_codes::FATAL);
    }

    #[test]
    fn exit_codes_follow_termination() {
        assert_eq!(
            exit_code(&result(Vec::new(), Termination::Complete { round: 1 })),
            exit_codes::OK
        );
        assert_eq!(
            exit_code(&result(Vec::new(), Termination::LimitReached { max_iterations: 3 })),
            exit_codes::LIMIT_REACHED
        );
        let cancelled = Termination::Fatal(RoundFailure {
            round: 1,
            stage: Stage::Coding,
            cause: "cancelled".to_string(),
            cancelled: true,
        });
        let res = result(Vec::new(), cancelled);
        assert_eq!(exit_code(&res), exit_codes::CANCELLED);
        assert!(format_report(&res).contains("cancelled during coding in round 1"));
    }
}
