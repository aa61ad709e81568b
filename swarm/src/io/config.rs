//! Swarm configuration stored under `<workspace>/.swarm/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Directory (relative to the workspace) holding config and run artifacts.
pub const SWARM_DIR: &str = ".swarm";
pub const CONFIG_FILE: &str = "config.toml";

/// Default config location for a workspace.
pub fn default_config_path(workspace: &Path) -> PathBuf {
    workspace.join(SWARM_DIR).join(CONFIG_FILE)
}

/// Swarm configuration (TOML).
///
/// Meant to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Rounds allowed before the run ends as LIMIT_REACHED.
    pub max_iterations: u32,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Optional debug-level transcript file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,

    pub agent: AgentConfig,
    pub retry: RetryConfig,
    pub tests: TestsConfig,
    pub scaffold: ScaffoldConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI to invoke (`codex exec ...`).
    pub program: String,
    /// Extra arguments inserted after `exec`.
    pub extra_args: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Rendered prompts above this size drop optional sections.
    pub prompt_budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per agent call, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Regexes matched against failed agent output to mark it transient.
    pub retryable_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// In-memory cap per stream while the suite runs.
    pub output_limit_bytes: usize,
    /// Size of the condensed output handed to the reviewer.
    pub summary_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScaffoldConfig {
    /// File whose presence marks an initialized project.
    pub manifest: String,
    /// Command run once when the manifest is missing. Empty disables it.
    pub command: Vec<String>,
    pub dirs: Vec<String>,
    /// Empty files created when missing.
    pub files: Vec<String>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            log_level: "info".to_string(),
            transcript_path: None,
            agent: AgentConfig::default(),
            retry: RetryConfig::default(),
            tests: TestsConfig::default(),
            scaffold: ScaffoldConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            extra_args: Vec::new(),
            timeout_secs: 15 * 60,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 40_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1500,
            max_delay_ms: 30_000,
            retryable_patterns: vec![
                r"(?i)rate.?limit".to_string(),
                r"\b429\b".to_string(),
                r"(?i)overloaded".to_string(),
                r"(?i)capacity".to_string(),
            ],
        }
    }
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: vec!["pytest".to_string(), "-q".to_string()],
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
            summary_limit_bytes: 20_000,
        }
    }
}

impl Default for ScaffoldConfig {
    fn default() -> Self {
        Self {
            manifest: "pyproject.toml".to_string(),
            command: vec!["uv".to_string(), "init".to_string(), ".".to_string()],
            dirs: vec!["src".to_string(), "tests".to_string()],
            files: vec![
                "src/__init__.py".to_string(),
                "tests/__init__.py".to_string(),
            ],
        }
    }
}

impl SwarmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be >= 1"));
        }
        if self.log_level.trim().is_empty() {
            return Err(anyhow!("log_level must not be empty"));
        }
        self.agent.validate()?;
        self.retry.validate()?;
        self.tests.validate()?;
        self.scaffold.validate()?;
        Ok(())
    }
}

impl AgentConfig {
    fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(anyhow!("agent.program must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("agent.prompt_budget_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be >= 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow!("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        self.compile_patterns()?;
        Ok(())
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn compile_patterns(&self) -> Result<Vec<Regex>> {
        self.retryable_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("retry.retryable_patterns: invalid regex {pattern:?}"))
            })
            .collect()
    }
}

impl TestsConfig {
    fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("tests.command must be a non-empty array"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("tests.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("tests.output_limit_bytes must be > 0"));
        }
        if self.summary_limit_bytes == 0 {
            return Err(anyhow!("tests.summary_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ScaffoldConfig {
    fn validate(&self) -> Result<()> {
        if self.manifest.trim().is_empty() {
            return Err(anyhow!("scaffold.manifest must not be empty"));
        }
        if self.command.first().is_some_and(|c| c.trim().is_empty()) {
            return Err(anyhow!("scaffold.command must not start with an empty program"));
        }
        for rel in self.dirs.iter().chain(&self.files) {
            let path = Path::new(rel);
            if rel.trim().is_empty()
                || path.is_absolute()
                || path.components().any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(anyhow!(
                    "scaffold paths must be relative and stay inside the workspace: {rel:?}"
                ));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SwarmConfig::default()`.
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    if !path.exists() {
        let cfg = SwarmConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SwarmConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SwarmConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
