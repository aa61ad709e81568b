//! Run settings resolved from CLI flags, environment and the config file.
//!
//! Precedence: CLI flag > environment > config file > default. The goal and
//! the workspace have no default and never come from the config file, since
//! the file itself lives inside the workspace.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::io::config::{SwarmConfig, default_config_path, load_config};

pub const ENV_GOAL: &str = "SWARM_GOAL";
pub const ENV_WORKSPACE: &str = "SWARM_WORKSPACE";
pub const ENV_MAX_ITERATIONS: &str = "SWARM_MAX_ITERATIONS";

/// Everything a run needs, validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub goal: String,
    pub workspace: PathBuf,
    /// Effective config with overrides applied.
    pub config: SwarmConfig,
}

impl RunSettings {
    pub fn max_iterations(&self) -> u32 {
        self.config.max_iterations
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub goal: Option<String>,
    pub workspace: Option<PathBuf>,
    pub max_iterations: Option<u32>,
    pub config: Option<PathBuf>,
    pub log_level: Option<String>,
    pub transcript: Option<PathBuf>,
}

/// Resolve settings from the process environment.
pub fn resolve(cli: &Overrides) -> Result<RunSettings> {
    resolve_with(cli, |key| std::env::var(key).ok())
}

/// Resolve settings with an injectable environment lookup.
pub fn resolve_with(cli: &Overrides, env: impl Fn(&str) -> Option<String>) -> Result<RunSettings> {
    let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    let goal = cli
        .goal
        .clone()
        .or_else(|| env(ENV_GOAL))
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .ok_or_else(|| anyhow!("a goal is required (--goal or {ENV_GOAL})"))?;

    let workspace = cli
        .workspace
        .clone()
        .or_else(|| env(ENV_WORKSPACE).map(PathBuf::from))
        .ok_or_else(|| anyhow!("a workspace is required (--workspace or {ENV_WORKSPACE})"))?;
    let workspace = std::path::absolute(&workspace)
        .with_context(|| format!("resolve workspace {}", workspace.display()))?;

    let mut config = match &cli.config {
        Some(path) => {
            if !path.is_file() {
                bail!("config file {} does not exist", path.display());
            }
            load_config(path)?
        }
        None => load_config(&default_config_path(&workspace))?,
    };

    if let Some(n) = cli.max_iterations {
        config.max_iterations = n;
    } else if let Some(raw) = env(ENV_MAX_ITERATIONS) {
        config.max_iterations = raw
            .trim()
            .parse()
            .with_context(|| format!("{ENV_MAX_ITERATIONS} must be a positive integer, got {raw:?}"))?;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(path) = &cli.transcript {
        config.transcript_path = Some(path.clone());
    } else if let Some(path) = config.transcript_path.take() {
        config.transcript_path = Some(relative_to(&workspace, path));
    }

    config.validate().context("invalid settings")?;
    debug!(
        workspace = %workspace.display(),
        max_iterations = config.max_iterations,
        "resolved run settings"
    );
    Ok(RunSettings {
        goal,
        workspace,
        config,
    })
}

/// Relative paths from the config file are anchored at the workspace.
fn relative_to(workspace: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        workspace.join(path)
    }
}
