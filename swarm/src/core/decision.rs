//! Termination policy evaluated after every reviewed round.

use crate::core::types::Verdict;

/// What the loop does after a round has been reviewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDecision {
    /// Start the next round with the reviewer's feedback.
    Continue,
    /// The reviewer accepted the work.
    Complete,
    /// The last allowed round ended without acceptance.
    LimitReached,
}

/// Decide how to proceed after `round` (1-indexed) was reviewed.
///
/// Priority: an accepting verdict wins, then the iteration limit. `Unknown`
/// is never treated as acceptance. The planner's `complete` flag plays no part.
pub fn decide(verdict: Verdict, round: u32, max_iterations: u32) -> RoundDecision {
    if verdict == Verdict::Pass {
        return RoundDecision::Complete;
    }
    if round >= max_iterations {
        return RoundDecision::LimitReached;
    }
    RoundDecision::Continue
}
