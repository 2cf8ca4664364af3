//! Durable per-channel conversation journal.
//!
//! One append-only JSONL file per channel. Every `append` performs a
//! synchronous durable write (write + fsync) — throughput is traded for the
//! invariant that a crash never loses an acknowledged turn. The on-disk log
//! is always a valid prefix of the in-memory active turn list.
//!
//! Replay skips malformed lines (torn trailing writes after a crash) instead
//! of failing, so the rest of the journal remains usable.

mod record;

pub use record::{JournalEntry, JournalRecord, Turn, TurnPart, TurnRole};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use ulid::Ulid;

/// Prefix for generated session identifiers.
pub const SESSION_ID_PREFIX: &str = "session_";

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error during a journal read or write.
    #[error("journal I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error serializing a record.
    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JournalError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Append-only journal for one channel's conversation turns.
pub struct SessionJournal {
    path: PathBuf,
    session_id: String,
    created_at: DateTime<Utc>,
    model_id: String,
    next_seq: u64,
}

impl SessionJournal {
    /// Open (or create) the journal for a channel, replaying existing
    /// records. Returns the journal and the active turn list reconstructed
    /// across compaction and reset boundaries.
    pub async fn open(
        journals_dir: &Path,
        channel_id: &str,
        model_id: &str,
    ) -> Result<(Self, Vec<Turn>), JournalError> {
        fs::create_dir_all(journals_dir)
            .await
            .map_err(|e| JournalError::io(journals_dir, e))?;

        let path = journals_dir.join(format!("{}.jsonl", sanitize_channel(channel_id)));

        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(JournalError::io(&path, e)),
        };

        let replay = replay_records(&path, &contents);

        let mut journal = match replay.meta {
            Some(meta) => Self {
                path,
                session_id: meta.session_id,
                created_at: meta.created_at,
                model_id: meta.model_id,
                next_seq: replay.last_seq + 1,
            },
            None => {
                // Fresh journal: mint an identity and make it durable before
                // the first turn is accepted.
                let mut journal = Self {
                    path,
                    session_id: new_session_id(),
                    created_at: Utc::now(),
                    model_id: model_id.to_string(),
                    next_seq: 1,
                };
                journal.write_session_start().await?;
                journal
            }
        };

        if journal.model_id != model_id {
            journal.append_model_change(model_id).await?;
        }

        debug!(
            session_id = %journal.session_id,
            path = %journal.path.display(),
            active_turns = replay.active.len(),
            "journal opened"
        );

        Ok((journal, replay.active))
    }

    /// The current session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When the current session identity was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The model identifier last recorded for this journal.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Durably append a conversation turn. The turn is on disk (fsynced)
    /// before this returns.
    pub async fn append_turn(&mut self, turn: &Turn) -> Result<u64, JournalError> {
        self.append(JournalRecord::Turn { turn: turn.clone() }).await
    }

    /// Durably append a compaction summary record.
    pub async fn append_compaction(
        &mut self,
        summary: &Turn,
        retained: usize,
    ) -> Result<u64, JournalError> {
        self.append(JournalRecord::CompactionSummary {
            summary: summary.clone(),
            retained,
        })
        .await
    }

    /// Durably record a model change.
    pub async fn append_model_change(&mut self, model_id: &str) -> Result<u64, JournalError> {
        let seq = self
            .append(JournalRecord::ModelChange {
                model_id: model_id.to_string(),
            })
            .await?;
        self.model_id = model_id.to_string();
        Ok(seq)
    }

    /// Truncate the journal and issue a new session identifier.
    ///
    /// Caller is responsible for quiescence (no turn in flight).
    pub async fn reset(&mut self, model_id: &str) -> Result<(), JournalError> {
        fs::write(&self.path, b"")
            .await
            .map_err(|e| JournalError::io(&self.path, e))?;

        self.session_id = new_session_id();
        self.created_at = Utc::now();
        self.model_id = model_id.to_string();
        self.next_seq = 1;
        self.write_session_start().await?;

        debug!(session_id = %self.session_id, "journal reset");
        Ok(())
    }

    /// Delete a channel's journal file without opening it. Missing files
    /// are fine.
    pub async fn remove(journals_dir: &Path, channel_id: &str) -> Result<(), JournalError> {
        let path = journals_dir.join(format!("{}.jsonl", sanitize_channel(channel_id)));
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JournalError::io(&path, e)),
        }
    }

    async fn write_session_start(&mut self) -> Result<(), JournalError> {
        self.append(JournalRecord::SessionStart {
            session_id: self.session_id.clone(),
            model_id: self.model_id.clone(),
        })
        .await?;
        Ok(())
    }

    async fn append(&mut self, record: JournalRecord) -> Result<u64, JournalError> {
        let seq = self.next_seq;
        let entry = JournalEntry::new(seq, record);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| JournalError::io(&self.path, e))?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|e| JournalError::io(&self.path, e))?;

        // fsync before acknowledging: the durability invariant of the journal.
        file.sync_all()
            .await
            .map_err(|e| JournalError::io(&self.path, e))?;

        self.next_seq = seq + 1;
        Ok(seq)
    }
}

impl std::fmt::Debug for SessionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionJournal")
            .field("session_id", &self.session_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Replay
// ============================================================================

struct JournalMeta {
    session_id: String,
    created_at: DateTime<Utc>,
    model_id: String,
}

struct Replay {
    meta: Option<JournalMeta>,
    active: Vec<Turn>,
    last_seq: u64,
}

/// Replay journal lines into the active turn list.
///
/// Malformed lines are skipped with a warning; everything parseable before
/// and after them remains usable.
fn replay_records(path: &Path, contents: &str) -> Replay {
    let mut meta: Option<JournalMeta> = None;
    let mut active: Vec<Turn> = Vec::new();
    let mut last_seq = 0u64;

    for (line_no, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let entry = match serde_json::from_str::<JournalEntry>(trimmed) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    %error,
                    "skipping malformed journal record"
                );
                continue;
            }
        };

        last_seq = last_seq.max(entry.seq);

        match entry.record {
            JournalRecord::SessionStart {
                session_id,
                model_id,
            } => {
                active.clear();
                meta = Some(JournalMeta {
                    session_id,
                    created_at: entry.timestamp,
                    model_id,
                });
            }
            JournalRecord::Turn { turn } => active.push(turn),
            JournalRecord::CompactionSummary { summary, retained } => {
                let tail_start = active.len().saturating_sub(retained);
                let recent: Vec<Turn> = active.split_off(tail_start);
                active.clear();
                active.push(summary);
                active.extend(recent);
            }
            JournalRecord::ModelChange { model_id } => {
                if let Some(ref mut meta) = meta {
                    meta.model_id = model_id;
                }
            }
        }
    }

    Replay {
        meta,
        active,
        last_seq,
    }
}

fn new_session_id() -> String {
    format!("{}{}", SESSION_ID_PREFIX, Ulid::new())
}

/// Map a channel identifier to a safe file stem.
fn sanitize_channel(channel_id: &str) -> String {
    channel_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
