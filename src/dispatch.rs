//! Quick dispatch: an ordered list of `(predicate, handler)` pairs evaluated
//! before falling back to the agent executor.
//!
//! This reproduces heuristic text-pattern dispatch as a pluggable layer that
//! stays decoupled from the turn state machine: a hit produces the assistant
//! reply directly, a miss is invisible. Empty by default.

/// A single dispatch rule.
pub struct DispatchRule {
    name: String,
    predicate: Box<dyn Fn(&str) -> bool + Send + Sync>,
    handler: Box<dyn Fn(&str) -> String + Send + Sync>,
}

impl std::fmt::Debug for DispatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRule")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A dispatch hit: which rule matched and the reply it produced.
#[derive(Debug, Clone)]
pub struct DispatchHit {
    pub rule: String,
    pub reply: String,
}

/// Ordered rule list. First matching predicate wins.
#[derive(Debug, Default)]
pub struct QuickDispatch {
    rules: Vec<DispatchRule>,
}

impl QuickDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Rules are evaluated in insertion order.
    pub fn rule(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
        handler: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(DispatchRule {
            name: name.into(),
            predicate: Box::new(predicate),
            handler: Box::new(handler),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate rules in order against the request text.
    pub fn dispatch(&self, text: &str) -> Option<DispatchHit> {
        for rule in &self.rules {
            if (rule.predicate)(text) {
                return Some(DispatchHit {
                    rule: rule.name.clone(),
                    reply: (rule.handler)(text),
                });
            }
        }
        None
    }
}
