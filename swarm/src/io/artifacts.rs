//! Run artifacts under `<workspace>/.swarm/runs/<run-id>/`.
//!
//! Each round gets its own directory holding the parsed stage outputs and the
//! raw agent traffic. `report.json` is written once per run, on every
//! termination.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;

use crate::core::parse::{PLAN_SCHEMA, REVIEW_SCHEMA};
use crate::core::types::{CoderSummary, Plan, Review, Role, TestResult, WorkflowResult};
use crate::io::config::write_atomic;
use crate::io::scaffold::SwarmPaths;

pub const REPORT_FILE: &str = "report.json";

/// Paths shared by every round of one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub dir: PathBuf,
    pub report_path: PathBuf,
    pub plan_schema_path: PathBuf,
    pub review_schema_path: PathBuf,
}

impl RunPaths {
    pub fn new(workspace: &Path, run_id: &str) -> Self {
        let dir = SwarmPaths::new(workspace).runs_dir.join(run_id);
        Self {
            run_id: run_id.to_string(),
            report_path: dir.join(REPORT_FILE),
            plan_schema_path: dir.join("schemas").join("plan.schema.json"),
            review_schema_path: dir.join("schemas").join("review.schema.json"),
            dir,
        }
    }

    pub fn round(&self, round: u32) -> RoundPaths {
        RoundPaths::new(&self.dir, round)
    }
}

/// Artifact paths for a single round.
#[derive(Debug, Clone)]
pub struct RoundPaths {
    pub dir: PathBuf,
    pub plan_path: PathBuf,
    pub coder_path: PathBuf,
    pub tests_path: PathBuf,
    pub review_path: PathBuf,
}

impl RoundPaths {
    pub fn new(run_dir: &Path, round: u32) -> Self {
        let dir = run_dir.join(round.to_string());
        Self {
            plan_path: dir.join("plan.json"),
            coder_path: dir.join("coder.md"),
            tests_path: dir.join("tests.log"),
            review_path: dir.join("review.json"),
            dir,
        }
    }

    /// Final message written by the agent for `role`.
    pub fn reply_path(&self, role: Role) -> PathBuf {
        self.dir.join(format!("{role}.reply.txt"))
    }

    /// Stdout/stderr of the agent process for `role`.
    pub fn log_path(&self, role: Role) -> PathBuf {
        self.dir.join(format!("{role}.log"))
    }
}

/// Allocate a fresh run directory and write the output schemas into it.
///
/// Ids are UTC timestamps; a numeric suffix is added when two runs start in
/// the same second.
pub fn create_run(workspace: &Path) -> Result<RunPaths> {
    let runs_dir = SwarmPaths::new(workspace).runs_dir;
    fs::create_dir_all(&runs_dir).with_context(|| format!("create {}", runs_dir.display()))?;
    let base = format!("run-{}", Utc::now().format("%Y%m%d_%H%M%S"));

    for attempt in 1..=100u32 {
        let run_id = if attempt == 1 {
            base.clone()
        } else {
            format!("{base}-{attempt}")
        };
        let paths = RunPaths::new(workspace, &run_id);
        match fs::create_dir(&paths.dir) {
            Ok(()) => {
                write_text(&paths.plan_schema_path, PLAN_SCHEMA)?;
                write_text(&paths.review_schema_path, REVIEW_SCHEMA)?;
                return Ok(paths);
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", paths.dir.display()));
            }
        }
    }
    Err(anyhow!("could not allocate a run directory under {}", runs_dir.display()))
}

pub fn write_plan(paths: &RoundPaths, plan: &Plan) -> Result<()> {
    write_json(&paths.plan_path, plan)
}

pub fn write_coder(paths: &RoundPaths, summary: &CoderSummary) -> Result<()> {
    let mut buf = summary.as_str().to_string();
    buf.push('\n');
    write_text(&paths.coder_path, &buf)
}

pub fn write_tests(paths: &RoundPaths, result: &TestResult) -> Result<()> {
    write_text(&paths.tests_path, &result.summary())
}

pub fn write_review(paths: &RoundPaths, review: &Review) -> Result<()> {
    write_json(&paths.review_path, review)
}

/// Persist the final report (temp file + rename).
pub fn write_report(paths: &RunPaths, result: &WorkflowResult) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(result).context("serialize report")?;
    buf.push('\n');
    write_atomic(&paths.report_path, &buf)
}

/// Load a report written by [`write_report`].
pub fn load_report(path: &Path) -> Result<WorkflowResult> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse report {}", path.display()))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::core::types::{Termination, Verdict};

    #[test]
    fn round_paths_are_stable() {
        let paths = RunPaths::new(Path::new("/ws"), "run-1").round(3);
        assert!(paths.dir.ends_with(Path::new(".swarm/runs/run-1/3")));
        assert!(paths.plan_path.ends_with("plan.json"));
        assert!(paths.reply_path(Role::Reviewer).ends_with("reviewer.reply.txt"));
        assert!(paths.log_path(Role::Coder).ends_with("coder.log"));
    }

    #[test]
    fn runs_started_together_get_distinct_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = create_run(temp.path()).expect("first");
        let second = create_run(temp.path()).expect("second");
        assert_ne!(first.run_id, second.run_id);
        assert!(first.plan_schema_path.is_file());
        assert!(second.review_schema_path.is_file());
    }

    #[test]
    fn writes_round_artifacts_and_report() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = create_run(temp.path()).expect("run");
        let round = run.round(1);

        let plan = Plan {
            steps: vec!["add".to_string()],
            files: BTreeSet::new(),
            complete: false,
        };
        write_plan(&round, &plan).expect("plan");
        write_coder(&round, &CoderSummary::new("did it")).expect("coder");
        write_review(
            &round,
            &Review {
                verdict: Verdict::Fail,
                summary: "nope".to_string(),
                issues: Vec::new(),
                feedback: "fix".to_string(),
                raw: None,
            },
        )
        .expect("review");
        assert!(round.plan_path.is_file());
        assert_eq!(
            fs::read_to_string(&round.coder_path).expect("read"),
            "did it\n"
        );

        let result = WorkflowResult {
            run_id: run.run_id.clone(),
            goal: "g".to_string(),
            workspace: temp.path().to_path_buf(),
            max_iterations: 1,
            iterations: Vec::new(),
            termination: Termination::LimitReached { max_iterations: 1 },
        };
        write_report(&run, &result).expect("report");
        assert_eq!(load_report(&run.report_path).expect("load"), result);
    }
}
