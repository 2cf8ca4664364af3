//! Per-channel session management.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐        ┌────────────────┐
//!  │ Orchestrator │──owns──▶ ChannelSession │  (one per channel)
//!  │ (registry)   │        │  journal +     │
//!  └──────┬───────┘        │  active turns  │
//!         │ submit          └───────▲───────┘
//!         ▼                         │ single-flight
//!  ┌──────────────┐                 │
//!  │ RequestQueue │─────────────────┘  (busy flag + bounded FIFO)
//!  └──────────────┘
//! ```
//!
//! - **RequestQueue** — the busy flag is the per-channel mutex; while a turn
//!   is in flight, submissions queue FIFO with oldest-first eviction on
//!   overflow.
//! - **ChannelSession** — owns the journal and active turn list; runs turns
//!   (executor stream, throttled edits, timeout, retry) and drains the queue
//!   after each turn completes.

mod channel;
mod queue;

pub use channel::{ChannelSession, SessionDeps, TurnOutcome};
pub use queue::{DrainResult, RequestQueue, SubmitDisposition, TurnRequest};
