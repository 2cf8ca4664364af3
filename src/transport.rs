//! Outbound transport seam.
//!
//! The transport delivers textual replies back to the originating channel
//! and supports incremental edits for live-updating replies. Incremental
//! edit failures are best-effort and never fatal to a turn.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from transport delivery.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport send failed: {0}")]
    Send(String),
}

/// External reply transport for one or more channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver the terminal message for a turn.
    async fn send_final(&self, channel_id: &str, text: &str) -> Result<(), TransportError>;

    /// Update the in-progress reply. Best effort; callers swallow failures.
    async fn send_incremental_edit(
        &self,
        channel_id: &str,
        text: &str,
    ) -> Result<(), TransportError>;
}
