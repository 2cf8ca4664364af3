//! Per-channel bounded request queue with atomic busy/enqueue/drain
//! operations.
//!
//! The busy flag is the channel's single-flight mutex: at most one turn
//! executes at a time. While busy, submissions queue FIFO; when the queue is
//! at capacity the **oldest** queued request is evicted to make room —
//! last-writer-priority backpressure, not FIFO-reject.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

/// An inbound request bound for a channel's turn runner.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Idempotency key (source message identifier).
    pub request_id: String,
    /// Channel this request belongs to.
    pub channel_id: String,
    /// Requesting identity.
    pub sender_id: String,
    /// Request text.
    pub text: String,
    /// When the request arrived.
    pub received_at: DateTime<Utc>,
}

impl TurnRequest {
    pub fn new(
        request_id: impl Into<String>,
        channel_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Result of attempting to enqueue a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDisposition {
    /// Channel was idle — caller should run this request now.
    ProcessNow,
    /// Request was added to the pending queue.
    Queued,
    /// Queue was full: the oldest queued request was evicted to make room
    /// and this request was queued.
    QueuedEvictedOldest,
}

/// Result of draining the queue after a turn completes.
#[derive(Debug)]
pub enum DrainResult {
    /// Take the next request (oldest remaining) and run it.
    Next(Box<TurnRequest>),
    /// Queue is empty — channel is now idle.
    Idle,
}

struct QueueInner {
    busy: bool,
    pending: VecDeque<TurnRequest>,
}

/// Bounded FIFO of pending requests for one channel.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    max_pending: usize,
}

impl RequestQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                busy: false,
                pending: VecDeque::new(),
            }),
            max_pending,
        }
    }

    /// Try to enqueue a request.
    ///
    /// If the channel is idle, marks it busy and returns `ProcessNow` — the
    /// caller runs the request. Otherwise the request queues, evicting the
    /// oldest pending request when at capacity.
    pub async fn try_enqueue(&self, request: TurnRequest) -> SubmitDisposition {
        let mut inner = self.inner.lock().await;

        if !inner.busy {
            inner.busy = true;
            return SubmitDisposition::ProcessNow;
        }

        if inner.pending.len() >= self.max_pending {
            if let Some(evicted) = inner.pending.pop_front() {
                warn!(
                    channel_id = %request.channel_id,
                    evicted_request = %evicted.request_id,
                    queued_request = %request.request_id,
                    "request queue full, evicting oldest pending request"
                );
            }
            inner.pending.push_back(request);
            return SubmitDisposition::QueuedEvictedOldest;
        }

        inner.pending.push_back(request);
        SubmitDisposition::Queued
    }

    /// Drain the queue after a turn completes.
    ///
    /// Returns the next request (oldest remaining) to run, or marks the
    /// channel idle when the queue is empty.
    pub async fn drain(&self) -> DrainResult {
        let mut inner = self.inner.lock().await;

        match inner.pending.pop_front() {
            Some(request) => DrainResult::Next(Box::new(request)),
            None => {
                inner.busy = false;
                DrainResult::Idle
            }
        }
    }

    /// Mark the channel idle (used when a runner fails before draining).
    pub async fn mark_idle(&self) {
        let mut inner = self.inner.lock().await;
        inner.busy = false;
    }

    /// Whether a turn is currently in flight.
    pub async fn is_busy(&self) -> bool {
        self.inner.lock().await.busy
    }

    /// Number of queued requests.
    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}
