//! Tracing setup for the swarm CLI.
//!
//! - **Console**: compact events on stderr. `RUST_LOG` wins over the
//!   configured level.
//! - **Transcript** (optional): every `debug` event, including prompts, raw
//!   agent replies and full test output, appended to a file without ANSI colors.
//!
//! Run artifacts under `.swarm/runs/` are written regardless of log settings.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// # Example
/// ```bash
/// RUST_LOG=swarm=debug swarm run --goal "..." --workspace ./ws
/// ```
pub fn init(level: &str, transcript: Option<&Path>) -> Result<()> {
    let console_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?,
    };
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .compact()
        .with_filter(console_filter);

    let transcript_layer = match transcript {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create transcript dir {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open transcript {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(transcript_layer)
        .try_init()
        .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}
