//! Agent executor seam.
//!
//! The language model backend is an external collaborator: it accepts a
//! prompt, streams events over a bounded channel, and supports cancellation.
//! Nothing in this crate models the model API itself.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::journal::Turn;

/// Capacity of the event channel handed back by an executor.
///
/// Bounded so a fast producer blocks instead of growing an unbounded
/// callback fan-out.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Model configuration resolved for a requesting identity.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Model identifier recorded in the journal.
    pub model_id: String,
    /// Per-model history budget override, in estimated tokens.
    pub max_history_tokens: Option<u32>,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            max_history_tokens: None,
        }
    }
}

/// Resolves the model configuration for a requesting identity.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, sender_id: &str) -> ModelConfig;
}

/// A resolver that hands every identity the same configuration.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    config: ModelConfig,
}

impl StaticResolver {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl ModelResolver for StaticResolver {
    fn resolve(&self, _sender_id: &str) -> ModelConfig {
        self.config.clone()
    }
}

/// Incremental event produced by an in-flight agent run.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A chunk of reply text.
    TextDelta { text: String },
    /// A tool execution started.
    ToolStart {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// A tool execution finished.
    ToolEnd {
        call_id: String,
        name: String,
        success: bool,
        content: String,
    },
    /// The run completed normally.
    Done,
    /// The run failed terminally.
    Error { message: String },
}

/// Errors from starting an agent run.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The call to the model transport failed.
    #[error("agent transport failure: {message}")]
    Transport { message: String, transient: bool },

    /// The executor rejected the prompt.
    #[error("agent rejected the prompt: {0}")]
    Rejected(String),
}

impl AgentError {
    pub fn transport(message: impl Into<String>, transient: bool) -> Self {
        Self::Transport {
            message: message.into(),
            transient,
        }
    }

    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                transient: true,
                ..
            }
        )
    }
}

/// Handle to an in-flight agent run: a bounded event stream plus a
/// cancellation hook.
pub struct AgentRun {
    events: mpsc::Receiver<AgentEvent>,
    abort: Option<Box<dyn FnOnce() + Send>>,
}

impl AgentRun {
    pub fn new(
        events: mpsc::Receiver<AgentEvent>,
        abort: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            abort: Some(Box::new(abort)),
        }
    }

    /// Receive the next event. `None` means the producer went away without
    /// a terminal `Done`/`Error` event.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Cancel the in-flight run. Consumes the handle, so cancellation fires
    /// at most once.
    pub fn abort(mut self) {
        if let Some(abort) = self.abort.take() {
            abort();
        }
    }
}

impl std::fmt::Debug for AgentRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRun").finish_non_exhaustive()
    }
}

/// External agent executor.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Start a run over the given prompt turns.
    async fn run(&self, prompt: &[Turn], model: &ModelConfig) -> Result<AgentRun, AgentError>;
}
