//! Top-level orchestrator: routes inbound requests to channel sessions.
//!
//! The orchestrator owns the channel registry explicitly (a `DashMap` tied
//! to its own lifetime — never ambient module state), enforces the
//! allow-list, deduplicates redelivered requests, applies rate limits, and
//! hands accepted requests to the owning channel's single-flight queue.
//! Callers are never blocked on turn completion; replies arrive through the
//! transport.

mod limits;

pub use limits::{DedupCache, RateLimiter};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::agent::{AgentExecutor, ModelResolver};
use crate::config::Config;
use crate::dispatch::QuickDispatch;
use crate::journal::JournalError;
use crate::session::{ChannelSession, SessionDeps, SubmitDisposition, TurnRequest};
use crate::transport::Transport;

/// An inbound request from a gateway or webhook.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Idempotency key, e.g. the source message identifier.
    pub request_id: String,
    /// Target channel.
    pub channel_id: String,
    /// Requesting identity.
    pub sender_id: String,
    /// Request text.
    pub text: String,
}

/// Accepted submission result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Request was routed to its channel session.
    Accepted { disposition: SubmitDisposition },
    /// Request carried an already-seen idempotency key; no turn triggered.
    Duplicate,
}

/// Synchronous rejection of a submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The sender is not on the configured allow-list.
    #[error("sender is not authorized")]
    Unauthorized,

    /// The sender's (or the global) rate-limit window is exhausted.
    #[error("rate limited, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

/// Routes inbound requests to per-channel sessions.
pub struct Orchestrator {
    deps: SessionDeps,
    sessions: DashMap<String, Arc<ChannelSession>>,
    limiter: RateLimiter,
    dedup: DedupCache,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        executor: Arc<dyn AgentExecutor>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn ModelResolver>,
    ) -> Self {
        Self::with_dispatch(config, executor, transport, resolver, QuickDispatch::new())
    }

    /// Construct with a quick-dispatch table evaluated before the executor.
    pub fn with_dispatch(
        config: Arc<Config>,
        executor: Arc<dyn AgentExecutor>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn ModelResolver>,
        dispatch: QuickDispatch,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit.clone());
        let dedup = DedupCache::new(config.dedup.clone());

        Self {
            deps: SessionDeps {
                executor,
                transport,
                resolver,
                dispatch: Arc::new(dispatch),
                config,
            },
            sessions: DashMap::new(),
            limiter,
            dedup,
        }
    }

    /// Submit an inbound request.
    ///
    /// Authorization and rate-limit failures are rejected synchronously,
    /// before any turn starts. On acceptance this returns immediately; the
    /// turn runs on a spawned task and completion is delivered through the
    /// transport.
    pub async fn submit(&self, request: InboundRequest) -> Result<SubmitOutcome, SubmitError> {
        if !self.is_authorized(&request.sender_id) {
            debug!(
                channel_id = %request.channel_id,
                sender_id = %request.sender_id,
                "submission denied by allow-list"
            );
            return Err(SubmitError::Unauthorized);
        }

        // Dedup before the rate limiter so a redelivered event neither
        // triggers a turn nor consumes rate budget.
        if !self.dedup.insert(&request.request_id) {
            debug!(
                channel_id = %request.channel_id,
                request_id = %request.request_id,
                "duplicate request ignored"
            );
            return Ok(SubmitOutcome::Duplicate);
        }

        if let Err(retry_after) = self.limiter.check(&request.sender_id) {
            debug!(
                channel_id = %request.channel_id,
                sender_id = %request.sender_id,
                retry_after_secs = retry_after.as_secs(),
                "submission rate limited"
            );
            return Err(SubmitError::RateLimited { retry_after });
        }

        let session = self.session_for(&request.channel_id);
        let turn_request = TurnRequest::new(
            request.request_id,
            request.channel_id,
            request.sender_id,
            request.text,
        );

        let disposition = session.submit(turn_request.clone()).await;
        if disposition == SubmitDisposition::ProcessNow {
            tokio::spawn(session.clone().run_loop(turn_request));
        }

        Ok(SubmitOutcome::Accepted { disposition })
    }

    /// Reset a channel's conversation: truncate its journal and clear its
    /// active history. Returns `false` when the channel has no session.
    ///
    /// Caller is responsible for quiescence on that channel.
    pub async fn reset(&self, channel_id: &str) -> Result<bool, JournalError> {
        let Some(session) = self.sessions.get(channel_id).map(|s| s.clone()) else {
            return Ok(false);
        };
        session.reset().await?;
        Ok(true)
    }

    /// Look up a channel's session, if one exists.
    pub fn session(&self, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.sessions.get(channel_id).map(|s| s.clone())
    }

    /// Number of live channel sessions.
    pub fn channel_count(&self) -> usize {
        self.sessions.len()
    }

    fn is_authorized(&self, sender_id: &str) -> bool {
        let allowlist = &self.deps.config.allowlist;
        allowlist.is_empty() || allowlist.iter().any(|id| id == sender_id)
    }

    /// Get or create the session for a channel. The `DashMap` entry API
    /// makes creation atomic under concurrent submissions.
    fn session_for(&self, channel_id: &str) -> Arc<ChannelSession> {
        self.sessions
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelSession::new(channel_id, self.deps.clone()))
            .clone()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("channels", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
