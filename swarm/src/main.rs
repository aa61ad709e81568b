//! `swarm` command line.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use swarm::cancel::CancelToken;
use swarm::core::types::WorkflowResult;
use swarm::exit_codes;
use swarm::io::artifacts::load_report;
use swarm::io::config::SwarmConfig;
use swarm::io::invoker::CodexInvoker;
use swarm::io::scaffold::{InitOptions, SwarmPaths, init_swarm};
use swarm::io::test_runner::CommandTestRunner;
use swarm::logging;
use swarm::report::{exit_code, format_report};
use swarm::settings::{Overrides, resolve};
use swarm::workflow::run_workflow;

#[derive(Parser, Debug)]
#[command(
    name = "swarm",
    version,
    about = "Iterative planner / coder / tester / reviewer loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run rounds until the reviewer passes or the iteration limit is reached.
    Run(RunArgs),
    /// Scaffold the workspace and write `.swarm/config.toml`.
    Init {
        /// Workspace directory.
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print a stored `report.json`.
    Report {
        /// Path to a run's report.json.
        path: PathBuf,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// What the agents should build (or SWARM_GOAL).
    #[arg(short, long)]
    goal: Option<String>,
    /// Directory the coder edits and the tests run in (or SWARM_WORKSPACE).
    #[arg(short, long)]
    workspace: Option<PathBuf>,
    /// Maximum number of rounds, at least 1 (or SWARM_MAX_ITERATIONS).
    #[arg(short = 'n', long)]
    max_iterations: Option<u32>,
    /// Config file (default: <workspace>/.swarm/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Console log filter, e.g. `info` or `swarm=debug`. RUST_LOG wins.
    #[arg(long)]
    log_level: Option<String>,
    /// Append a debug-level transcript to this file.
    #[arg(long)]
    transcript: Option<PathBuf>,
    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            goal: self.goal.clone(),
            workspace: self.workspace.clone(),
            max_iterations: self.max_iterations,
            config: self.config.clone(),
            log_level: self.log_level.clone(),
            transcript: self.transcript.clone(),
        }
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
        }
    };
    let outcome = match cli.command {
        Command::Run(args) => cmd_run(&args),
        Command::Init { workspace, force } => cmd_init(&workspace, force),
        Command::Report { path, json } => cmd_report(&path, json),
    };
    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    }
}

fn cmd_run(args: &RunArgs) -> Result<i32> {
    let settings = resolve(&args.overrides())?;
    logging::init(
        &settings.config.log_level,
        settings.config.transcript_path.as_deref(),
    )?;

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone(), Some(SwarmPaths::new(&settings.workspace).runs_dir))?;
    let invoker = CodexInvoker::new(&settings.config.agent, &settings.config.retry, cancel.clone())?;
    let test_runner = CommandTestRunner::new(cancel.clone());

    let result = run_workflow(&settings, &invoker, &test_runner, &cancel)?;
    print_result(&result, args.json)?;
    Ok(exit_code(&result))
}

fn cmd_init(workspace: &Path, force: bool) -> Result<i32> {
    let config = SwarmConfig::default();
    logging::init(&config.log_level, None)?;
    let workspace = std::path::absolute(workspace)
        .with_context(|| format!("resolve workspace {}", workspace.display()))?;

    let cancel = CancelToken::new();
    watch_ctrl_c(cancel.clone(), None)?;
    let (paths, report) = init_swarm(&workspace, &config, &InitOptions { force }, &cancel)?;
    for warning in &report.warnings {
        warn!(warning = %warning, "workspace scaffold");
    }
    info!(config = %paths.config_path.display(), "swarm initialized");
    println!("{}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_report(path: &Path, json: bool) -> Result<i32> {
    let result = load_report(path)?;
    print_result(&result, json)?;
    Ok(exit_code(&result))
}

fn print_result(result: &WorkflowResult, json: bool) -> Result<()> {
    if json {
        let payload = serde_json::to_string_pretty(result).context("serialize report")?;
        println!("{payload}");
    } else {
        print!("{}", format_report(result));
    }
    Ok(())
}

/// Cancel `token` on the first Ctrl-C and exit on the second.
///
/// `runs_dir` is named on a forced exit; completed rounds are already on disk there.
fn watch_ctrl_c(token: CancelToken, runs_dir: Option<PathBuf>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if token.is_cancelled() {
                        let message = forced_exit_message(runs_dir.as_deref());
                        error!("{message}");
                        eprintln!("{message}");
                        std::process::exit(exit_codes::CANCELLED);
                    }
                    warn!("interrupt received, stopping after the current step");
                    token.cancel();
                }
            });
        })
        .context("spawn ctrl-c thread")?;
    Ok(())
}

fn forced_exit_message(runs_dir: Option<&Path>) -> String {
    match runs_dir {
        Some(dir) => format!(
            "interrupted again, exiting without a final report; round artifacts are under {}",
            dir.display()
        ),
        None => "interrupted again, exiting".to_string(),
    }
}
