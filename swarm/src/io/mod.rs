//! Side-effecting adapters: config, processes, agents, tests and artifacts.

pub mod artifacts;
pub mod config;
pub mod invoker;
pub mod process;
pub mod prompt;
pub mod scaffold;
pub mod test_runner;
