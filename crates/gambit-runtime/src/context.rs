//! Execution context handed to native executors.
//!
//! All session mutation goes through these methods so every change
//! publishes a `state.update` to the parent; executors never touch the
//! bridge or the saved state directly.

use crate::bridge::WorkerLink;
use gambit_core::error::{Error, Result};
use gambit_core::protocol::SpawnRequestPayload;
use gambit_core::state::SavedState;
use gambit_core::types::{Message, RunResult};
use gambit_sandbox::PermissionSet;
use std::path::{Path, PathBuf};

/// Options for a nested spawn issued by an executor.
#[derive(Clone, Debug)]
pub struct SpawnOptions {
    /// Deck path or executor key, resolved relative to the deck's
    /// directory when relative.
    pub path: String,
    pub input: serde_json::Value,
    pub label: Option<String>,
}

impl SpawnOptions {
    pub fn new(path: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            path: path.into(),
            input,
            label: None,
        }
    }
}

/// The value passed to a native executor.
pub struct ExecutionContext<'a> {
    pub(crate) link: &'a mut WorkerLink,
    pub(crate) state: &'a mut SavedState,
    pub(crate) deck_dir: PathBuf,
    pub(crate) permissions: PermissionSet,
    pub(crate) action_call_id: String,
    pub(crate) parent_action_call_id: Option<String>,
    pub(crate) depth: u32,
    pub(crate) input: serde_json::Value,
    pub(crate) initial_user_message: Option<String>,
    pub(crate) label: Option<String>,
}

impl ExecutionContext<'_> {
    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn action_call_id(&self) -> &str {
        &self.action_call_id
    }

    pub fn parent_action_call_id(&self) -> Option<&str> {
        self.parent_action_call_id.as_deref()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn initial_user_message(&self) -> Option<&str> {
        self.initial_user_message.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The effective permission set this run executes under. Checks
    /// failing here surface to the executor as `PermissionDenied`.
    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    /// Read a file through the sandbox's read scope.
    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        if !self.permissions.can_read(path) {
            return Err(Error::PermissionDenied(path.display().to_string()));
        }
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Write a file through the sandbox's write scope.
    pub async fn write_file(&self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        let path = path.as_ref();
        if !self.permissions.can_write(path) {
            return Err(Error::PermissionDenied(path.display().to_string()));
        }
        Ok(tokio::fs::write(path, content).await?)
    }

    pub fn get_session_meta(&self, key: &str) -> Option<serde_json::Value> {
        self.state.get_meta(key).cloned()
    }

    /// Set a meta entry and publish the updated state.
    pub async fn set_session_meta(&mut self, key: &str, value: serde_json::Value) -> Result<()> {
        self.state.set_meta(key, value);
        self.link.publish_state(self.state).await
    }

    /// Append a message and publish the updated state.
    pub async fn append_message(&mut self, message: Message) -> Result<()> {
        self.state.messages.push(message);
        self.link.publish_state(self.state).await
    }

    /// Emit a log entry through the bridge.
    pub async fn log(&self, level: &str, message: impl Into<String>) -> Result<()> {
        self.link.log(level, message).await
    }

    /// Spawn a nested deck and wait for its result. The returned value is
    /// the child's JSON projection; the child cannot mutate this run's
    /// state.
    pub async fn spawn_and_wait(&mut self, options: SpawnOptions) -> Result<serde_json::Value> {
        let path = resolve_spawn_path(&self.deck_dir, &options.path);
        let result = self
            .link
            .request_spawn(SpawnRequestPayload {
                path,
                name: None,
                input: options.input,
                label: options.label,
                action_call_id: Some(self.action_call_id.clone()),
            })
            .await?;
        Ok(run_result_value(result))
    }

    /// Construct the failure an executor returns to abort the run.
    pub fn fail(&self, message: impl Into<String>, code: Option<&str>) -> Error {
        Error::Remote {
            name: "ExecutorError".to_string(),
            message: message.into(),
            code: code.map(str::to_string),
        }
    }
}

fn resolve_spawn_path(deck_dir: &Path, raw: &str) -> String {
    let p = Path::new(raw);
    if p.is_absolute() || !raw.contains('/') {
        // Absolute paths and bare executor keys pass through.
        raw.to_string()
    } else {
        deck_dir.join(p).to_string_lossy().into_owned()
    }
}

fn run_result_value(result: RunResult) -> serde_json::Value {
    match result {
        RunResult::Responded { payload, .. } => payload,
        RunResult::Ended { payload, .. } => payload.unwrap_or(serde_json::Value::Null),
        RunResult::Text { text } => serde_json::Value::String(text),
        RunResult::Value { value } => value,
        RunResult::ToolCalls { calls } => serde_json::to_value(calls).unwrap_or_default(),
    }
}
