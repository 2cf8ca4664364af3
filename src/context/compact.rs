//! Context reduction: per-request budget trimming and count-triggered
//! history compaction.
//!
//! The two mechanisms are independent and deliberately not unified:
//! - `trim_to_budget` bounds what a single prompt carries, by estimated
//!   token cost, without touching durable state.
//! - `plan_compaction` fires on active turn **count** and folds old history
//!   into a synthesized summary turn that is journaled durably.

use tracing::debug;

use crate::journal::{Turn, TurnRole};

use super::tokens::estimate_turn_tokens;

/// Maximum number of topic snippets carried into a compaction summary.
const MAX_TOPIC_SNIPPETS: usize = 5;

/// Maximum length of a single topic snippet, in bytes.
const TOPIC_SNIPPET_MAX_LEN: usize = 48;

/// Reduce a turn sequence to fit a token budget.
///
/// The most recent `keep_recent` turns are always retained verbatim — the
/// continuity floor. Older turns are walked backward (most recent first),
/// accumulating estimated cost, until adding the next older turn would
/// exceed `token_budget`. Everything excluded is dropped from the returned
/// prompt only; the durable journal is untouched.
pub fn trim_to_budget(turns: &[Turn], token_budget: u32, keep_recent: usize) -> Vec<Turn> {
    let split = turns.len().saturating_sub(keep_recent);
    let (older, recent) = turns.split_at(split);

    let mut kept: Vec<Turn> = Vec::with_capacity(turns.len());
    let mut used = 0u32;
    let mut included = 0usize;

    for turn in older.iter().rev() {
        let cost = estimate_turn_tokens(turn);
        if used + cost > token_budget {
            break;
        }
        used += cost;
        included += 1;
    }

    if included < older.len() {
        debug!(
            dropped = older.len() - included,
            budget = token_budget,
            "older turns excluded from prompt by token budget"
        );
    }

    kept.extend(older[older.len() - included..].iter().cloned());
    kept.extend(recent.iter().cloned());
    kept
}

/// Whether the active turn count has crossed the compaction ceiling.
pub fn needs_compaction(turns: &[Turn], ceiling: usize) -> bool {
    turns.len() > ceiling
}

/// Whether a sequence is already in compacted form: a summary marker
/// followed by at most `keep_recent` turns. Compacting such a sequence must
/// be a no-op.
pub fn is_compacted(turns: &[Turn], keep_recent: usize) -> bool {
    turns
        .first()
        .is_some_and(Turn::is_marker)
        && turns.len() <= keep_recent + 1
}

/// A planned history compaction.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    /// The synthesized summary turn covering the folded prefix.
    pub summary: Turn,
    /// The retained recent tail, verbatim.
    pub recent: Vec<Turn>,
    /// How many turns the summary replaced.
    pub folded: usize,
}

impl CompactionPlan {
    /// The new active sequence: `[summary, ...recent]`.
    pub fn into_active(self) -> Vec<Turn> {
        let mut active = Vec::with_capacity(self.recent.len() + 1);
        active.push(self.summary);
        active.extend(self.recent);
        active
    }
}

/// Plan a history compaction: partition into `old` (all but the last
/// `keep_recent`) and `recent`, and synthesize one summary turn from `old`.
///
/// Returns `None` when the sequence is already compacted (idempotence) or
/// there is nothing to fold.
pub fn plan_compaction(turns: &[Turn], keep_recent: usize) -> Option<CompactionPlan> {
    if is_compacted(turns, keep_recent) {
        return None;
    }

    let split = turns.len().saturating_sub(keep_recent);
    if split == 0 {
        return None;
    }

    let (old, recent) = turns.split_at(split);

    Some(CompactionPlan {
        summary: build_summary(old),
        recent: recent.to_vec(),
        folded: old.len(),
    })
}

/// Synthesize a summary turn from folded history: user/assistant turn
/// counts plus up to five distinct topic snippets from user turn text.
fn build_summary(old: &[Turn]) -> Turn {
    let user_count = old.iter().filter(|t| t.role == TurnRole::User).count();
    let assistant_count = old.iter().filter(|t| t.role == TurnRole::Assistant).count();

    let mut topics: Vec<String> = Vec::new();
    for turn in old {
        if turn.role != TurnRole::User {
            continue;
        }
        let snippet = topic_snippet(&turn.text());
        if snippet.is_empty() || topics.iter().any(|t| t == &snippet) {
            continue;
        }
        topics.push(snippet);
        if topics.len() >= MAX_TOPIC_SNIPPETS {
            break;
        }
    }

    let mut text = format!(
        "Earlier conversation compacted: {user_count} user turns and {assistant_count} assistant turns."
    );
    if !topics.is_empty() {
        text.push_str(" Topics: ");
        text.push_str(&topics.join("; "));
        text.push('.');
    }

    Turn::system_marker(text)
}

/// First line of a user turn, truncated at a char boundary.
fn topic_snippet(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.len() <= TOPIC_SNIPPET_MAX_LEN {
        return first_line.to_string();
    }
    let mut end = TOPIC_SNIPPET_MAX_LEN;
    while end > 0 && !first_line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &first_line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tokens::estimate_turn_tokens;

    fn exchange(n: usize) -> Vec<Turn> {
        let mut turns = Vec::new();
        for i in 1..=n {
            if i % 2 == 1 {
                turns.push(Turn::user(format!("question {i}")));
            } else {
                turns.push(Turn::assistant_text(format!("answer {i}")));
            }
        }
        turns
    }

    // ------------------------------------------------------------------------
    // trim_to_budget
    // ------------------------------------------------------------------------

    #[test]
    fn trim_keeps_recent_tail_regardless_of_budget() {
        let turns = exchange(10);
        let trimmed = trim_to_budget(&turns, 0, 4);

        assert_eq!(trimmed.len(), 4);
        assert_eq!(trimmed[0].text(), turns[6].text());
        assert_eq!(trimmed[3].text(), turns[9].text());
    }

    #[test]
    fn trim_includes_older_turns_up_to_budget() {
        let turns = exchange(10);
        // Budget for exactly two older turns (walked most-recent-first).
        let budget =
            estimate_turn_tokens(&turns[5]) + estimate_turn_tokens(&turns[4]);
        let trimmed = trim_to_budget(&turns, budget, 4);

        assert_eq!(trimmed.len(), 6);
        assert_eq!(trimmed[0].text(), turns[4].text());
    }

    #[test]
    fn trim_with_large_budget_keeps_everything() {
        let turns = exchange(6);
        let trimmed = trim_to_budget(&turns, u32::MAX, 2);
        assert_eq!(trimmed.len(), 6);
    }

    #[test]
    fn trim_short_history_is_unchanged() {
        let turns = exchange(3);
        let trimmed = trim_to_budget(&turns, 0, 8);
        assert_eq!(trimmed.len(), 3);
    }

    // ------------------------------------------------------------------------
    // compaction trigger and idempotence
    // ------------------------------------------------------------------------

    #[test]
    fn needs_compaction_is_count_based() {
        assert!(!needs_compaction(&exchange(20), 20));
        assert!(needs_compaction(&exchange(21), 20));
    }

    #[test]
    fn compacted_sequence_is_detected() {
        let mut turns = vec![Turn::system_marker("summary")];
        turns.extend(exchange(8));
        assert!(is_compacted(&turns, 8));

        // One more turn than keep_recent: no longer in compacted form.
        turns.push(Turn::user("new"));
        assert!(!is_compacted(&turns, 8));
    }

    #[test]
    fn plan_is_none_for_already_compacted_sequence() {
        let mut turns = vec![Turn::system_marker("summary")];
        turns.extend(exchange(6));
        assert!(plan_compaction(&turns, 8).is_none());
    }

    #[test]
    fn compaction_is_idempotent() {
        let turns = exchange(25);
        let plan = plan_compaction(&turns, 8).unwrap();
        let active = plan.into_active();

        assert!(plan_compaction(&active, 8).is_none());
    }

    // ------------------------------------------------------------------------
    // plan_compaction
    // ------------------------------------------------------------------------

    #[test]
    fn plan_partitions_old_and_recent() {
        let turns = exchange(25);
        let plan = plan_compaction(&turns, 8).unwrap();

        assert_eq!(plan.folded, 17);
        assert_eq!(plan.recent.len(), 8);
        assert_eq!(plan.recent[0].text(), turns[17].text());

        let active = plan.into_active();
        assert_eq!(active.len(), 9);
        assert!(active[0].is_marker());
    }

    #[test]
    fn twenty_five_turns_ceiling_twenty_keep_eight() {
        // A channel with 25 journaled turns, ceiling 20, keep 8: accepting
        // the next turn compacts first, so the active list becomes
        // summary + turn18..turn25 + the new turn — 10 entries.
        let turns = exchange(25);
        assert!(needs_compaction(&turns, 20));

        let mut active = plan_compaction(&turns, 8).unwrap().into_active();
        active.push(Turn::user("question 26"));

        assert_eq!(active.len(), 10);
        assert!(active[0].is_marker());
        assert_eq!(active[1].text(), "answer 18");
        assert_eq!(active[8].text(), "question 25");
        assert_eq!(active[9].text(), "question 26");
    }

    #[test]
    fn summary_counts_roles_and_collects_topics() {
        let turns = exchange(25);
        let plan = plan_compaction(&turns, 8).unwrap();
        let text = plan.summary.text();

        // 17 folded turns: questions 1,3,..17 (9 user) and answers 2,..16 (8).
        assert!(text.contains("9 user turns"));
        assert!(text.contains("8 assistant turns"));
        assert!(text.contains("question 1"));
        // At most five topic snippets.
        assert!(!text.contains("question 11"));
    }

    #[test]
    fn summary_topics_are_distinct() {
        let turns = vec![
            Turn::user("same topic"),
            Turn::user("same topic"),
            Turn::user("other topic"),
            Turn::assistant_text("ok"),
            Turn::user("tail 1"),
            Turn::user("tail 2"),
        ];
        let plan = plan_compaction(&turns, 2).unwrap();
        let text = plan.summary.text();

        assert_eq!(text.matches("same topic").count(), 1);
        assert!(text.contains("other topic"));
    }

    #[test]
    fn topic_snippet_truncates_at_char_boundary() {
        let long = "á".repeat(100);
        let snippet = topic_snippet(&long);
        assert!(snippet.len() <= TOPIC_SNIPPET_MAX_LEN + '…'.len_utf8());
        assert!(snippet.ends_with('…'));
    }
}
