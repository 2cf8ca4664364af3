//! Token estimation for context budget management.
//!
//! Uses a byte-length heuristic (`ceil(bytes / 4)`) rather than a real
//! tokenizer. Intentionally approximate — the goal is budget management,
//! not precision.

use crate::journal::Turn;

/// Estimate the number of tokens in a text string.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

/// Estimate the number of tokens a turn contributes to a prompt.
///
/// Based on the serialized length of the whole turn so that tool call and
/// tool result payloads are counted, not just the visible text.
pub fn estimate_turn_tokens(turn: &Turn) -> u32 {
    match serde_json::to_string(turn) {
        Ok(json) => estimate_tokens(&json),
        Err(_) => estimate_tokens(&turn.text()),
    }
}

/// Estimate the total token cost of a turn sequence.
pub fn estimate_turns_tokens(turns: &[Turn]) -> u32 {
    turns.iter().map(estimate_turn_tokens).sum()
}
