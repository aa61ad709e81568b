//! Deterministic, pure logic for the iteration loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod condense;
pub mod decision;
pub mod parse;
pub mod types;
