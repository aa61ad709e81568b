//! Workspace preparation before the first round, and `.swarm/` layout.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, is_cancellation};
use crate::io::config::{CONFIG_FILE, SWARM_DIR, ScaffoldConfig, SwarmConfig, write_config};
use crate::io::process::run_command_with_timeout;

const SWARM_GITIGNORE: &str = "*\n";
const SCAFFOLD_TIMEOUT: Duration = Duration::from_secs(120);
const SCAFFOLD_OUTPUT_LIMIT: usize = 64 * 1024;

/// Canonical paths within `.swarm/` for a workspace.
#[derive(Debug, Clone)]
pub struct SwarmPaths {
    pub workspace: PathBuf,
    pub swarm_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub runs_dir: PathBuf,
}

impl SwarmPaths {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        let swarm_dir = workspace.join(SWARM_DIR);
        Self {
            workspace,
            gitignore_path: swarm_dir.join(".gitignore"),
            config_path: swarm_dir.join(CONFIG_FILE),
            runs_dir: swarm_dir.join("runs"),
            swarm_dir,
        }
    }
}

/// What `ensure_workspace` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaffoldReport {
    pub created_workspace: bool,
    /// The scaffold command ran and exited successfully.
    pub ran_command: bool,
    /// Human-readable problems that did not stop the run.
    pub warnings: Vec<String>,
}

/// Prepare `workspace` for round 1.
///
/// Creates the directory, runs the scaffold command once when the manifest is
/// missing, then creates the layout directories and files. Missing scaffold
/// tooling or a failing scaffold command only produce warnings.
pub fn ensure_workspace(
    workspace: &Path,
    cfg: &ScaffoldConfig,
    cancel: &CancelToken,
) -> Result<ScaffoldReport> {
    let mut report = ScaffoldReport::default();
    if workspace.exists() && !workspace.is_dir() {
        return Err(anyhow!(
            "workspace {} exists but is not a directory",
            workspace.display()
        ));
    }
    if !workspace.exists() {
        fs::create_dir_all(workspace)
            .with_context(|| format!("create workspace {}", workspace.display()))?;
        info!(workspace = %workspace.display(), "created workspace");
        report.created_workspace = true;
    }

    let nested = workspace.join("workspace");
    if nested.is_dir() {
        let msg = format!(
            "nested directory {} found; the coder may be writing one level too deep",
            nested.display()
        );
        warn!("{msg}");
        report.warnings.push(msg);
    }

    if !workspace.join(&cfg.manifest).exists() {
        match run_scaffold_command(workspace, &cfg.command, cancel) {
            Ok(true) => report.ran_command = true,
            Ok(false) => {}
            Err(err) if is_cancellation(&err) => return Err(err),
            Err(err) => {
                let msg = format!("scaffold command failed: {err:#}");
                warn!("{msg}");
                report.warnings.push(msg);
            }
        }
    } else {
        debug!(manifest = %cfg.manifest, "manifest present; skipping scaffold command");
    }

    for dir in &cfg.dirs {
        let path = workspace.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("create {}", path.display()))?;
    }
    for file in &cfg.files {
        let path = workspace.join(file);
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, "").with_context(|| format!("create {}", path.display()))?;
    }

    ensure_swarm_dir(&SwarmPaths::new(workspace))?;
    Ok(report)
}

/// Returns `Ok(false)` when no command is configured or the tool is not installed.
fn run_scaffold_command(workspace: &Path, command: &[String], cancel: &CancelToken) -> Result<bool> {
    let Some((program, args)) = command.split_first() else {
        return Ok(false);
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workspace);
    info!(command = %command.join(" "), "running scaffold command");
    let output = match run_command_with_timeout(cmd, None, SCAFFOLD_TIMEOUT, SCAFFOLD_OUTPUT_LIMIT, cancel) {
        Ok(output) => output,
        Err(err) if is_not_found(&err) => {
            warn!(program = %program, "scaffold tool not installed; skipping");
            return Ok(false);
        }
        Err(err) => return Err(err),
    };
    if output.timed_out {
        return Err(anyhow!("`{}` timed out", command.join(" ")));
    }
    if !output.status.success() {
        return Err(anyhow!(
            "`{}` exited with {:?}: {}",
            command.join(" "),
            output.status.code(),
            output.combined().trim()
        ));
    }
    Ok(true)
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == ErrorKind::NotFound)
    })
}

/// Create `.swarm/` with a gitignore that hides run artifacts from version control.
pub fn ensure_swarm_dir(paths: &SwarmPaths) -> Result<()> {
    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create {}", paths.runs_dir.display()))?;
    if !paths.gitignore_path.exists() {
        fs::write(&paths.gitignore_path, SWARM_GITIGNORE)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    Ok(())
}

/// Options for `init_swarm`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config file.
    pub force: bool,
}

/// Scaffold `workspace` and write a default `.swarm/config.toml`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_swarm(
    workspace: &Path,
    cfg: &SwarmConfig,
    options: &InitOptions,
    cancel: &CancelToken,
) -> Result<(SwarmPaths, ScaffoldReport)> {
    let paths = SwarmPaths::new(workspace);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "swarm init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    let report = ensure_workspace(workspace, &cfg.scaffold, cancel)?;
    write_config(&paths.config_path, cfg)?;
    Ok((paths, report))
}
