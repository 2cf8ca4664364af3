//! Journal record types for durable conversation logging.
//!
//! Records are appended to a per-channel JSONL file. Each entry carries a
//! monotonic sequence number for replay ordering and an ISO-8601 timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// Inbound message from a channel participant.
    User,
    /// Reply produced by the agent executor.
    Assistant,
    /// Synthetic marker turn (compaction summary, error marker).
    SystemMarker,
}

/// One typed part of a turn's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnPart {
    Text {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        success: bool,
        content: String,
    },
    Thinking {
        text: String,
    },
}

/// One logical exchange unit. Immutable once written; turns are appended to
/// the journal, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub parts: Vec<TurnPart>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Create a user turn with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            parts: vec![TurnPart::Text { text: text.into() }],
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant turn from collected parts.
    pub fn assistant(parts: Vec<TurnPart>) -> Self {
        Self {
            role: TurnRole::Assistant,
            parts,
            timestamp: Utc::now(),
        }
    }

    /// Create an assistant turn with a single text part.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![TurnPart::Text { text: text.into() }])
    }

    /// Create a synthetic marker turn with a single text part.
    pub fn system_marker(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::SystemMarker,
            parts: vec![TurnPart::Text { text: text.into() }],
            timestamp: Utc::now(),
        }
    }

    /// Concatenated text parts. Tool payloads and thinking are excluded.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let TurnPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Whether this turn is a synthetic marker (e.g. a compaction summary).
    pub fn is_marker(&self) -> bool {
        self.role == TurnRole::SystemMarker
    }
}

/// A journal entry: sequence number, timestamp, and a tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic sequence number for replay ordering.
    pub seq: u64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// The entry payload.
    #[serde(flatten)]
    pub record: JournalRecord,
}

impl JournalEntry {
    #[must_use]
    pub fn new(seq: u64, record: JournalRecord) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            record,
        }
    }
}

/// Self-describing journal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Journal (re)created with a fresh session identity.
    SessionStart {
        session_id: String,
        model_id: String,
    },
    /// A conversation turn was accepted.
    Turn { turn: Turn },
    /// A prefix of history was replaced by a generated summary. The active
    /// list after this record is `[summary] + last retained turns`; earlier
    /// turns stay in the file for audit but are never replayed into a prompt.
    CompactionSummary { summary: Turn, retained: usize },
    /// The model serving this channel changed.
    ModelChange { model_id: String },
}
