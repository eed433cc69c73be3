//! Worker bridge protocol — the two-party wire vocabulary.
//!
//! Wire format (JSON, one object per message):
//!
//! Parent → Worker:
//!   { "type": "run.start", "bridgeSession": "b-1", "completionNonce": "n-1", "options": { ... } }
//!   { "type": "model.chat.result", "bridgeSession": "b-1", "requestId": "req-1", "turn": { ... } }
//!   { "type": "spawn.result", "bridgeSession": "b-1", "requestId": "req-2", "result": { ... } }
//!
//! Worker → Parent:
//!   { "type": "model.chat.request", "bridgeSession": "b-1", "requestId": "req-1", "payload": { ... } }
//!   { "type": "state.update", "bridgeSession": "b-1", "state": { ... } }
//!   { "type": "run.result", "bridgeSession": "b-1", "completionNonce": "n-1", "result": { ... } }
//!
//! Every message carries `bridgeSession`; messages with a non-matching
//! session are ignored. The `completionNonce` attached to `run.start` is
//! echoed in `run.result`/`run.error` so stale completions can be
//! discarded.

use crate::error::ErrorPayload;
use crate::state::{ResponseItem, SavedState};
use crate::types::{ChatTurn, Guardrails, Message, ModelParams, RunResult, ToolDefinition, Usage};
use serde::{Deserialize, Serialize};

/// Fresh id for requests, sessions, and nonces.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Everything a worker needs to begin a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStartOptions {
    pub deck_path: String,
    pub input: serde_json::Value,
    pub depth: u32,
    pub action_call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_action_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Caller-requested model id; deck `modelParams` take precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_state: Option<SavedState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_tools: Vec<ToolDefinition>,
    pub guardrails: Guardrails,
    /// Absolute instant on the process monotonic clock; children inherit
    /// it unchanged.
    pub run_deadline_ms: u64,
    #[serde(default)]
    pub allow_root_string_input: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_user_message: Option<String>,
    /// Schemas the spawning action declared for this child, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

/// Serializable portion of a chat request; stream sinks stay on the
/// parent side and are forwarded as `model.chat.stream` messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestPayload {
    pub params: ModelParams,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsesRequestPayload {
    pub params: ModelParams,
    pub items: Vec<ResponseItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsesResultPayload {
    pub items: Vec<ResponseItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedModel {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<ModelParams>,
}

/// A worker's request to run a nested deck.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequestPayload {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_call_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Parent → Worker
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    #[serde(rename = "run.start", rename_all = "camelCase")]
    RunStart {
        bridge_session: String,
        completion_nonce: String,
        options: RunStartOptions,
    },

    #[serde(rename = "deck.inspect", rename_all = "camelCase")]
    DeckInspect {
        bridge_session: String,
        request_id: String,
        path: String,
    },

    #[serde(rename = "model.chat.result", rename_all = "camelCase")]
    ModelChatResult {
        bridge_session: String,
        request_id: String,
        turn: ChatTurn,
    },

    #[serde(rename = "model.responses.result", rename_all = "camelCase")]
    ModelResponsesResult {
        bridge_session: String,
        request_id: String,
        result: ResponsesResultPayload,
    },

    #[serde(rename = "model.resolveModel.result", rename_all = "camelCase")]
    ModelResolveModelResult {
        bridge_session: String,
        request_id: String,
        resolved: ResolvedModel,
    },

    /// Streamed token text for an in-flight chat request.
    #[serde(rename = "model.chat.stream", rename_all = "camelCase")]
    ModelChatStream {
        bridge_session: String,
        request_id: String,
        text: String,
    },

    #[serde(rename = "model.responses.event", rename_all = "camelCase")]
    ModelResponsesEvent {
        bridge_session: String,
        request_id: String,
        event: serde_json::Value,
    },

    #[serde(rename = "model.chat.trace", rename_all = "camelCase")]
    ModelChatTrace {
        bridge_session: String,
        request_id: String,
        event: serde_json::Value,
    },

    #[serde(rename = "model.responses.trace", rename_all = "camelCase")]
    ModelResponsesTrace {
        bridge_session: String,
        request_id: String,
        event: serde_json::Value,
    },

    #[serde(rename = "model.chat.error", rename_all = "camelCase")]
    ModelChatError {
        bridge_session: String,
        request_id: String,
        error: ErrorPayload,
    },

    #[serde(rename = "model.responses.error", rename_all = "camelCase")]
    ModelResponsesError {
        bridge_session: String,
        request_id: String,
        error: ErrorPayload,
    },

    #[serde(rename = "model.resolveModel.error", rename_all = "camelCase")]
    ModelResolveModelError {
        bridge_session: String,
        request_id: String,
        error: ErrorPayload,
    },

    #[serde(rename = "spawn.result", rename_all = "camelCase")]
    SpawnResult {
        bridge_session: String,
        request_id: String,
        result: RunResult,
    },

    #[serde(rename = "spawn.error", rename_all = "camelCase")]
    SpawnError {
        bridge_session: String,
        request_id: String,
        error: ErrorPayload,
    },
}

impl ParentMessage {
    pub fn bridge_session(&self) -> &str {
        match self {
            Self::RunStart { bridge_session, .. }
            | Self::DeckInspect { bridge_session, .. }
            | Self::ModelChatResult { bridge_session, .. }
            | Self::ModelResponsesResult { bridge_session, .. }
            | Self::ModelResolveModelResult { bridge_session, .. }
            | Self::ModelChatStream { bridge_session, .. }
            | Self::ModelResponsesEvent { bridge_session, .. }
            | Self::ModelChatTrace { bridge_session, .. }
            | Self::ModelResponsesTrace { bridge_session, .. }
            | Self::ModelChatError { bridge_session, .. }
            | Self::ModelResponsesError { bridge_session, .. }
            | Self::ModelResolveModelError { bridge_session, .. }
            | Self::SpawnResult { bridge_session, .. }
            | Self::SpawnError { bridge_session, .. } => bridge_session,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker → Parent
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    #[serde(rename = "model.chat.request", rename_all = "camelCase")]
    ModelChatRequest {
        bridge_session: String,
        request_id: String,
        payload: ChatRequestPayload,
    },

    #[serde(rename = "model.responses.request", rename_all = "camelCase")]
    ModelResponsesRequest {
        bridge_session: String,
        request_id: String,
        payload: ResponsesRequestPayload,
    },

    #[serde(rename = "model.resolveModel.request", rename_all = "camelCase")]
    ModelResolveModelRequest {
        bridge_session: String,
        request_id: String,
        model_id: String,
    },

    #[serde(rename = "spawn.request", rename_all = "camelCase")]
    SpawnRequest {
        bridge_session: String,
        request_id: String,
        payload: SpawnRequestPayload,
    },

    /// Full state snapshot, published on every mutation.
    #[serde(rename = "state.update", rename_all = "camelCase")]
    StateUpdate {
        bridge_session: String,
        state: SavedState,
    },

    #[serde(rename = "stream.text", rename_all = "camelCase")]
    StreamText {
        bridge_session: String,
        text: String,
    },

    #[serde(rename = "trace.event", rename_all = "camelCase")]
    TraceEvent {
        bridge_session: String,
        event: serde_json::Value,
    },

    #[serde(rename = "log.entry", rename_all = "camelCase")]
    LogEntry {
        bridge_session: String,
        level: String,
        message: String,
    },

    #[serde(rename = "run.result", rename_all = "camelCase")]
    RunResult {
        bridge_session: String,
        completion_nonce: String,
        result: RunResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        state: Option<SavedState>,
    },

    #[serde(rename = "run.error", rename_all = "camelCase")]
    RunError {
        bridge_session: String,
        completion_nonce: String,
        error: ErrorPayload,
    },

    #[serde(rename = "deck.inspect.result", rename_all = "camelCase")]
    DeckInspectResult {
        bridge_session: String,
        request_id: String,
        deck: serde_json::Value,
    },

    #[serde(rename = "deck.inspect.error", rename_all = "camelCase")]
    DeckInspectError {
        bridge_session: String,
        request_id: String,
        error: ErrorPayload,
    },
}

impl WorkerMessage {
    pub fn bridge_session(&self) -> &str {
        match self {
            Self::ModelChatRequest { bridge_session, .. }
            | Self::ModelResponsesRequest { bridge_session, .. }
            | Self::ModelResolveModelRequest { bridge_session, .. }
            | Self::SpawnRequest { bridge_session, .. }
            | Self::StateUpdate { bridge_session, .. }
            | Self::StreamText { bridge_session, .. }
            | Self::TraceEvent { bridge_session, .. }
            | Self::LogEntry { bridge_session, .. }
            | Self::RunResult { bridge_session, .. }
            | Self::RunError { bridge_session, .. }
            | Self::DeckInspectResult { bridge_session, .. }
            | Self::DeckInspectError { bridge_session, .. } => bridge_session,
        }
    }

    /// The completion nonce, for terminal messages.
    pub fn completion_nonce(&self) -> Option<&str> {
        match self {
            Self::RunResult {
                completion_nonce, ..
            }
            | Self::RunError {
                completion_nonce, ..
            } => Some(completion_nonce),
            _ => None,
        }
    }
}
