//! Common test utilities: scriptable mock executor and recording transport.
#![allow(dead_code)] // shared across test binaries that each use a subset

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};

use convoy::agent::{
    AgentError, AgentEvent, AgentExecutor, AgentRun, EVENT_CHANNEL_CAPACITY, ModelConfig,
};
use convoy::journal::{Turn, TurnRole};
use convoy::transport::{Transport, TransportError};

// ============================================================================
// Mock Executor
// ============================================================================

/// Scriptable agent executor.
///
/// By default every run echoes the last user turn (`re: <text>`). A gate
/// semaphore can hold runs in flight until the test releases permits, and
/// the executor can be told to fail its first N starts transiently or to
/// hang until aborted.
pub struct MockExecutor {
    /// Number of `run` calls made.
    pub runs: AtomicUsize,
    /// Number of aborts invoked on handed-out runs.
    pub aborts: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
    fail_starts: AtomicUsize,
    hang: bool,
}

impl MockExecutor {
    pub fn echoing() -> Self {
        Self {
            runs: AtomicUsize::new(0),
            aborts: Arc::new(AtomicUsize::new(0)),
            gate: None,
            fail_starts: AtomicUsize::new(0),
            hang: false,
        }
    }

    /// Runs wait for one gate permit each before emitting events.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::echoing()
        }
    }

    /// Fail the first `n` starts with a transient transport error.
    pub fn failing_starts(n: usize) -> Self {
        Self {
            fail_starts: AtomicUsize::new(n),
            ..Self::echoing()
        }
    }

    /// Never emit a terminal event; only an abort ends the run.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::echoing()
        }
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    async fn run(&self, prompt: &[Turn], _model: &ModelConfig) -> Result<AgentRun, AgentError> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AgentError::transport("connection reset", true));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let aborts = self.aborts.clone();

        if self.hang {
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(tx);
            });
            return Ok(AgentRun::new(rx, move || {
                handle.abort();
                aborts.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let last_user = prompt
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(Turn::text)
            .unwrap_or_default();
        let gate = self.gate.clone();

        let handle = tokio::spawn(async move {
            if let Some(gate) = gate {
                match gate.acquire_owned().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return,
                }
            }
            let _ = tx
                .send(AgentEvent::TextDelta {
                    text: format!("re: {last_user}"),
                })
                .await;
            let _ = tx.send(AgentEvent::Done).await;
        });

        Ok(AgentRun::new(rx, move || {
            handle.abort();
            aborts.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

// ============================================================================
// Mock Transport
// ============================================================================

/// Transport that records every delivery.
#[derive(Default)]
pub struct MockTransport {
    pub finals: Mutex<Vec<(String, String)>>,
    pub edits: Mutex<Vec<(String, String)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn final_texts(&self) -> Vec<String> {
        self.finals
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn final_count(&self) -> usize {
        self.finals.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_final(&self, channel_id: &str, text: &str) -> Result<(), TransportError> {
        self.finals
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_incremental_edit(
        &self,
        channel_id: &str,
        text: &str,
    ) -> Result<(), TransportError> {
        self.edits
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Poll until `cond` holds or the timeout elapses. Returns the final check.
pub async fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
