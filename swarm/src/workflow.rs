//! The iteration loop: planner, coder, tests and reviewer, round after round.
//!
//! Each round is a single [`RoundPhase`] value advanced one stage at a time
//! until the reviewer stage yields [`Advanced::Reviewed`].
//! After the reviewer speaks, [`decide`] picks between continuing, completing
//! and stopping at the iteration limit. Any stage error ends the run as FATAL
//! while keeping every completed round.

use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{error, info, info_span, warn};

use crate::agents::AgentSession;
use crate::agents::coder::run_coder;
use crate::agents::planner::run_planner;
use crate::agents::reviewer::run_reviewer;
use crate::cancel::{CancelToken, is_cancellation};
use crate::core::decision::{RoundDecision, decide};
use crate::core::types::{
    CoderSummary, IterationResult, Plan, RoundFailure, Stage, TestResult, Termination,
    WorkflowResult,
};
use crate::io::artifacts::{RoundPaths, RunPaths, create_run, write_report, write_tests};
use crate::io::invoker::AgentInvoker;
use crate::io::prompt::PromptContext;
use crate::io::scaffold::ensure_workspace;
use crate::io::test_runner::{TestRequest, TestRunner};
use crate::settings::RunSettings;

/// Cause recorded when the cancel token stops a run.
pub const CANCELLED_CAUSE: &str = "cancelled";

/// Progress of the round under construction.
#[derive(Debug)]
enum RoundPhase {
    Planning,
    Coding {
        plan: Plan,
    },
    Testing {
        plan: Plan,
        coder: CoderSummary,
    },
    Reviewing {
        plan: Plan,
        coder: CoderSummary,
        tests: TestResult,
    },
}

/// Result of advancing a phase by one stage.
#[derive(Debug)]
enum Advanced {
    Next(RoundPhase),
    Reviewed(IterationResult),
}

impl RoundPhase {
    /// Stage that advancing this phase will run.
    fn stage(&self) -> Stage {
        match self {
            RoundPhase::Planning => Stage::Planning,
            RoundPhase::Coding { .. } => Stage::Coding,
            RoundPhase::Testing { .. } => Stage::Testing,
            RoundPhase::Reviewing { .. } => Stage::Reviewing,
        }
    }
}

/// Run the loop until COMPLETE, LIMIT_REACHED or FATAL.
///
/// Errors are returned only for failures before round 1 (workspace or run
/// directory unusable). Every other outcome, including cancellation while the
/// workspace is prepared, is a [`WorkflowResult`] with `report.json` written.
pub fn run_workflow(
    settings: &RunSettings,
    invoker: &dyn AgentInvoker,
    test_runner: &dyn TestRunner,
    cancel: &CancelToken,
) -> Result<WorkflowResult> {
    let report = match ensure_workspace(&settings.workspace, &settings.config.scaffold, cancel) {
        Ok(report) => report,
        Err(err) if is_cancellation(&err) => return cancelled_before_rounds(settings),
        Err(err) => return Err(err.context("prepare workspace")),
    };
    for warning in &report.warnings {
        warn!(warning = %warning, "workspace scaffold");
    }
    let run = create_run(&settings.workspace).context("create run directory")?;
    info!(run_id = %run.run_id, goal = %settings.goal, max_iterations = settings.max_iterations(), "run started");

    let session = AgentSession::new(
        invoker,
        &settings.config,
        run.clone(),
        settings.workspace.clone(),
        cancel.clone(),
    )?;
    let rounds = Rounds {
        settings,
        session: &session,
        test_runner,
        cancel,
        workspace: settings.workspace.display().to_string(),
        test_command: settings.config.tests.command.join(" "),
    };

    let max_iterations = settings.max_iterations();
    let mut iterations: Vec<IterationResult> = Vec::new();
    let mut feedback: Option<String> = None;

    let termination = loop {
        let round = next_round(&iterations);
        let result = match rounds.run(round, feedback.as_deref()) {
            Ok(result) => result,
            Err(failure) => {
                error!(round, stage = %failure.stage, cause = %failure.cause, "round failed");
                break Termination::Fatal(failure);
            }
        };

        let decision = decide(result.review.verdict, round, max_iterations);
        info!(round, verdict = result.review.verdict.label(), ?decision, "round reviewed");
        feedback = Some(result.review.feedback.clone());
        iterations.push(result);

        match decision {
            RoundDecision::Continue => {}
            RoundDecision::Complete => break Termination::Complete { round },
            RoundDecision::LimitReached => break Termination::LimitReached { max_iterations },
        }
    };

    Ok(finish(settings, &run, iterations, termination))
}

/// Cancelled while preparing the workspace: no round ran.
fn cancelled_before_rounds(settings: &RunSettings) -> Result<WorkflowResult> {
    warn!("cancelled while preparing the workspace");
    let run = create_run(&settings.workspace).context("create run directory")?;
    let termination = Termination::Fatal(RoundFailure {
        round: 1,
        stage: Stage::Planning,
        cause: CANCELLED_CAUSE.to_string(),
        cancelled: true,
    });
    Ok(finish(settings, &run, Vec::new(), termination))
}

/// Assemble the result and write `report.json`.
fn finish(
    settings: &RunSettings,
    run: &RunPaths,
    iterations: Vec<IterationResult>,
    termination: Termination,
) -> WorkflowResult {
    let result = WorkflowResult {
        run_id: run.run_id.clone(),
        goal: settings.goal.clone(),
        workspace: settings.workspace.clone(),
        max_iterations: settings.max_iterations(),
        iterations,
        termination,
    };
    if let Err(err) = write_report(run, &result) {
        // The result is still returned and printed by the caller.
        error!(err = %format!("{err:#}"), path = %run.report_path.display(), "failed to write report");
    }
    info!(
        state = result.termination.label(),
        rounds = result.iterations.len(),
        report = %run.report_path.display(),
        "run finished"
    );
    result
}

fn next_round(iterations: &[IterationResult]) -> u32 {
    iterations.last().map_or(1, |last| last.round + 1)
}

/// Per-run context for executing rounds.
struct Rounds<'a> {
    settings: &'a RunSettings,
    session: &'a AgentSession<'a>,
    test_runner: &'a dyn TestRunner,
    cancel: &'a CancelToken,
    workspace: String,
    test_command: String,
}

impl Rounds<'_> {
    /// Drive one round from planning to review.
    fn run(&self, round: u32, feedback: Option<&str>) -> Result<IterationResult, RoundFailure> {
        let span = info_span!("round", round);
        let _guard = span.enter();

        let started = Instant::now();
        let paths = self.session.run_paths().round(round);
        let ctx = PromptContext {
            goal: &self.settings.goal,
            workspace: &self.workspace,
            test_command: &self.test_command,
            round,
            max_iterations: self.settings.max_iterations(),
        };

        let mut phase = RoundPhase::Planning;
        loop {
            let stage = phase.stage();
            info!(stage = %stage, "stage started");
            let advanced = self
                .cancel
                .check()
                .and_then(|()| self.advance(phase, round, &ctx, &paths, feedback))
                .map_err(|err| failure(round, stage, &err))?;
            phase = match advanced {
                Advanced::Next(next) => next,
                Advanced::Reviewed(mut result) => {
                    result.duration_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    return Ok(result);
                }
            };
        }
    }

    fn advance(
        &self,
        phase: RoundPhase,
        round: u32,
        ctx: &PromptContext<'_>,
        paths: &RoundPaths,
        feedback: Option<&str>,
    ) -> Result<Advanced> {
        Ok(match phase {
            RoundPhase::Planning => {
                let plan = run_planner(self.session, ctx, paths, feedback)?;
                Advanced::Next(RoundPhase::Coding { plan })
            }
            RoundPhase::Coding { plan } => {
                let coder = run_coder(self.session, ctx, paths, &plan)?;
                Advanced::Next(RoundPhase::Testing { plan, coder })
            }
            RoundPhase::Testing { plan, coder } => {
                let request =
                    TestRequest::from_config(self.settings.workspace.clone(), &self.settings.config.tests);
                let tests = self.test_runner.run(&request)?;
                write_tests(paths, &tests)?;
                info!(stage = "testing", passed = tests.passed, "tests finished");
                Advanced::Next(RoundPhase::Reviewing { plan, coder, tests })
            }
            RoundPhase::Reviewing { plan, coder, tests } => {
                let review = run_reviewer(self.session, ctx, paths, &plan, &coder, &tests)?;
                Advanced::Reviewed(IterationResult {
                    round,
                    plan,
                    coder,
                    tests,
                    review,
                    duration_ms: 0,
                })
            }
        })
    }
}

fn failure(round: u32, stage: Stage, err: &anyhow::Error) -> RoundFailure {
    let cancelled = is_cancellation(err);
    RoundFailure {
        round,
        stage,
        cause: if cancelled {
            CANCELLED_CAUSE.to_string()
        } else {
            format!("{err:#}")
        },
        cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parse::CLARIFY_FEEDBACK;
    use crate::core::types::{Role, Verdict};
    use crate::io::artifacts::load_report;
    use crate::test_support::{ScriptedInvoker, ScriptedReply, ScriptedTestRunner, settings_for};

    const GOAL: &str = "Add a function returning 2";

    fn push_round(invoker: &ScriptedInvoker, review: ScriptedReply) {
        invoker
            .push(Role::Planner, ScriptedReply::plan(&["write two()"], false))
            .push(Role::Coder, ScriptedReply::text("edited"))
            .push(Role::Reviewer, review);
    }

    fn fail() -> ScriptedReply {
        ScriptedReply::review("FAIL", "not yet", &["missing test"])
    }

    fn pass() -> ScriptedReply {
        ScriptedReply::review("PASS", "done", &[])
    }

    fn report_of(result: &WorkflowResult) -> WorkflowResult {
        let path = result
            .workspace
            .join(".swarm/runs")
            .join(&result.run_id)
            .join("report.json");
        load_report(&path).expect("report written")
    }

    #[test]
    fn pass_in_first_round_completes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        push_round(&invoker, pass());
        let tests = ScriptedTestRunner::new();
        tests.push_pass("1 passed");

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 3),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");

        assert_eq!(result.termination, Termination::Complete { round: 1 });
        assert_eq!(result.iterations.len(), 1);
        assert!(result.success());
        assert_eq!(tests.calls(), 1);
        assert_eq!(report_of(&result), result);
    }

    #[test]
    fn limit_is_reached_exactly_at_max_without_pass() {
        for max in 1..=3u32 {
            let temp = tempfile::tempdir().expect("tempdir");
            let invoker = ScriptedInvoker::new();
            for _ in 0..max {
                push_round(&invoker, fail());
            }
            let tests = ScriptedTestRunner::new();

            let result = run_workflow(
                &settings_for(temp.path(), GOAL, max),
                &invoker,
                &tests,
                &CancelToken::new(),
            )
            .expect("run");

            assert_eq!(result.termination, Termination::LimitReached { max_iterations: max });
            let rounds: Vec<u32> = result.iterations.iter().map(|r| r.round).collect();
            assert_eq!(rounds, (1..=max).collect::<Vec<_>>());
            assert_eq!(invoker.requests_for(Role::Planner).len(), max as usize);
        }
    }

    #[test]
    fn no_round_runs_after_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        push_round(&invoker, fail());
        push_round(&invoker, pass());
        push_round(&invoker, fail());
        let tests = ScriptedTestRunner::new();

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 5),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");

        assert_eq!(result.termination, Termination::Complete { round: 2 });
        assert_eq!(result.iterations.len(), 2);
        assert_eq!(invoker.remaining(Role::Planner), 1);
    }

    #[test]
    fn feedback_flows_to_next_planner_and_unknown_asks_for_clarification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        push_round(&invoker, fail());
        push_round(&invoker, ScriptedReply::text("looks fine, PASS"));
        push_round(&invoker, pass());
        let tests = ScriptedTestRunner::new();

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 3),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");

        assert_eq!(result.iterations[1].review.verdict, Verdict::Unknown);
        assert_eq!(result.termination, Termination::Complete { round: 3 });

        let planner = invoker.requests_for(Role::Planner);
        assert!(!planner[0].prompt.contains("Reviewer Feedback"));
        assert!(planner[1].prompt.contains("- missing test"));
        assert!(planner[2].prompt.contains(CLARIFY_FEEDBACK));
    }

    #[test]
    fn planner_complete_flag_does_not_end_the_loop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        invoker
            .push(Role::Planner, ScriptedReply::plan(&["all of it"], true))
            .push(Role::Coder, ScriptedReply::text("edited"))
            .push(Role::Reviewer, fail());
        push_round(&invoker, pass());
        let tests = ScriptedTestRunner::new();

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 3),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");
        assert!(result.iterations[0].plan.complete);
        assert_eq!(result.termination, Termination::Complete { round: 2 });
    }

    #[test]
    fn stage_failure_is_fatal_and_keeps_completed_rounds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        push_round(&invoker, fail());
        push_round(&invoker, fail());
        invoker.push(Role::Planner, ScriptedReply::plan(&["again"], false));
        invoker.push(Role::Coder, ScriptedReply::fatal("sandbox denied"));
        let tests = ScriptedTestRunner::new();

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 5),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");

        let Termination::Fatal(failure) = &result.termination else {
            panic!("expected fatal, got {:?}", result.termination);
        };
        assert_eq!(failure.round, 3);
        assert_eq!(failure.stage, Stage::Coding);
        assert!(failure.cause.contains("sandbox denied"));
        assert!(!failure.cancelled);
        assert_eq!(result.iterations.len(), 2);
        assert_eq!(report_of(&result), result);
    }

    #[test]
    fn test_infrastructure_failure_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        push_round(&invoker, fail());
        let tests = ScriptedTestRunner::new();
        tests.push_error("spawn pytest: No such file or directory");

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 3),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");

        let Termination::Fatal(failure) = &result.termination else {
            panic!("expected fatal");
        };
        assert_eq!(failure.stage, Stage::Testing);
        assert!(result.iterations.is_empty());
        assert!(invoker.requests_for(Role::Reviewer).is_empty());
    }

    #[test]
    fn transient_failures_within_budget_do_not_end_the_round() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        invoker
            .push(Role::Planner, ScriptedReply::transient())
            .push(Role::Planner, ScriptedReply::transient());
        push_round(&invoker, pass());
        let tests = ScriptedTestRunner::new();

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 1),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(result.termination, Termination::Complete { round: 1 });
        assert_eq!(invoker.requests_for(Role::Planner).len(), 3);
    }

    #[test]
    fn cancellation_is_fatal_with_cancelled_cause() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        let invoker = ScriptedInvoker::new();
        push_round(&invoker, fail());
        invoker
            .push(Role::Planner, ScriptedReply::plan(&["again"], false))
            .push(Role::Coder, ScriptedReply::Cancel(cancel.clone()));
        let tests = ScriptedTestRunner::new();

        let result =
            run_workflow(&settings_for(temp.path(), GOAL, 3), &invoker, &tests, &cancel)
                .expect("run");

        let Termination::Fatal(failure) = &result.termination else {
            panic!("expected fatal");
        };
        assert!(failure.cancelled);
        assert_eq!(failure.cause, CANCELLED_CAUSE);
        assert_eq!(failure.round, 2);
        assert_eq!(result.iterations.len(), 1);
        assert_eq!(tests.calls(), 1);
        assert_eq!(report_of(&result), result);
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_while_scaffolding_returns_a_cancelled_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut settings = settings_for(temp.path(), GOAL, 3);
        settings.config.scaffold.command =
            vec!["sh".to_string(), "-c".to_string(), "sleep 2".to_string()];
        let cancel = CancelToken::new();
        cancel.cancel();
        let invoker = ScriptedInvoker::new();
        let tests = ScriptedTestRunner::new();

        let result = run_workflow(&settings, &invoker, &tests, &cancel).expect("result, not error");

        let Termination::Fatal(failure) = &result.termination else {
            panic!("expected fatal, got {:?}", result.termination);
        };
        assert!(failure.cancelled);
        assert_eq!(failure.cause, CANCELLED_CAUSE);
        assert!(result.iterations.is_empty());
        assert!(invoker.requests().is_empty());
        assert_eq!(tests.calls(), 0);
        assert_eq!(report_of(&result), result);
    }

    #[test]
    fn round_artifacts_are_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let invoker = ScriptedInvoker::new();
        push_round(&invoker, pass());
        let tests = ScriptedTestRunner::new();
        tests.push_pass("1 passed");

        let result = run_workflow(
            &settings_for(temp.path(), GOAL, 1),
            &invoker,
            &tests,
            &CancelToken::new(),
        )
        .expect("run");

        let dir = temp.path().join(".swarm/runs").join(&result.run_id).join("1");
        for name in [
            "plan.json",
            "coder.md",
            "tests.log",
            "review.json",
            "planner.reply.txt",
            "coder.reply.txt",
            "reviewer.reply.txt",
        ] {
            assert!(dir.join(name).is_file(), "missing {name}");
        }
        assert!(temp.path().join(".swarm/.gitignore").is_file());
    }
}
