//! Cooperative cancellation for a running workflow.
//!
//! The token is checked at stage boundaries, during retry sleeps and while
//! waiting on child processes. Cancelling never discards completed rounds.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Granularity of cancellable waits.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error raised when the token fires. Callers detect it with `downcast_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("run cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Cloneable cancellation flag for synchronous code. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Return `Err(Cancelled)` once the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early with `Err(Cancelled)` on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

/// Whether `err` (or anything in its chain) is a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        let err = token.check().unwrap_err();
        assert!(is_cancellation(&err));
    }

    #[test]
    fn sleep_returns_early_when_cancelled() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let started = Instant::now();
        let err = token.sleep(Duration::from_secs(30)).unwrap_err();
        handle.join().expect("join");

        assert!(is_cancellation(&err));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_is_found_through_context() {
        let err = anyhow::Error::from(Cancelled).context("run coder");
        assert!(is_cancellation(&err));
        assert!(!is_cancellation(&anyhow::anyhow!("boom")));
    }
}
