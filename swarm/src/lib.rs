//! Iterative planner / coder / tester / reviewer loop.
//!
//! A run takes a natural-language goal and a workspace directory and repeats
//! rounds until the reviewer passes the work or the iteration limit is hit.
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure logic (records, structured-reply parsing, the round
//!   decision, output condensing). No I/O.
//! - **[`io`]**: Side effects (config files, child processes, the agent
//!   adapter, the test command, prompts, run artifacts). Agent and test
//!   execution sit behind traits so tests can script them.
//!
//! [`workflow`] drives rounds through [`agents`] and the test runner, with
//! [`retry`] and [`cancel`] wrapping every external call.

pub mod agents;
pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
pub mod retry;
pub mod settings;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
