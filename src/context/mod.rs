//! Context window management: token estimation, prompt trimming, and
//! count-triggered history compaction.

pub mod compact;
pub mod tokens;

pub use compact::{CompactionPlan, is_compacted, needs_compaction, plan_compaction, trim_to_budget};
pub use tokens::{estimate_tokens, estimate_turn_tokens, estimate_turns_tokens};
