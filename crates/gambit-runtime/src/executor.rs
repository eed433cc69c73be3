//! Native executor registry.
//!
//! Deck `execute = "..."` strings are keys into this registry; the
//! embedding application registers implementations before running decks.

use crate::context::ExecutionContext;
use gambit_core::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A native executor — the compute counterpart of a prompt deck.
///
/// Declared schemas participate in the same structural-equality check as
/// prompt-declared ones; the runtime validates executor input and output
/// against them.
#[async_trait::async_trait]
pub trait DeckExecutor: Send + Sync {
    /// Registry key, matched against `execute = "..."` declarations.
    fn name(&self) -> &str;

    fn context_schema(&self) -> Option<serde_json::Value> {
        None
    }

    fn response_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Run the executor. All session mutation goes through the context so
    /// every change publishes a `state.update`.
    async fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<serde_json::Value>;
}

/// Registry of native executors. Keys are the verbatim `execute` strings;
/// a path-shaped key also resolves by file stem.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn DeckExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its own name. Replaces any existing
    /// executor with the same key.
    pub fn register(&mut self, executor: impl DeckExecutor + 'static) {
        let key = executor.name().to_string();
        self.executors.insert(key, Arc::new(executor));
    }

    /// Exact key match, falling back to the path's file stem so
    /// `./native/summarize.exec` finds an executor named `summarize`.
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn DeckExecutor>> {
        if let Some(executor) = self.executors.get(key) {
            return Some(executor.clone());
        }
        let stem = Path::new(key).file_stem()?.to_str()?;
        self.executors.get(stem).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.executors.keys().map(|k| k.as_str()).collect()
    }
}
