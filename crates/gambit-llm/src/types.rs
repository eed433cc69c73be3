//! Provider request types.

use gambit_core::protocol::{ChatRequestPayload, ResponsesRequestPayload};
use gambit_core::state::ResponseItem;
use gambit_core::types::{Message, ModelParams, ToolDefinition};
use tokio::sync::mpsc;

/// Input to a chat-shaped model call. The sinks are optional; a provider
/// that streams sends token text and events as they arrive and still
/// returns the full turn.
#[derive(Clone, Debug, Default)]
pub struct ChatInput {
    pub params: ModelParams,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub on_stream_text: Option<mpsc::Sender<String>>,
    pub on_stream_event: Option<mpsc::Sender<serde_json::Value>>,
    pub on_trace_event: Option<mpsc::Sender<serde_json::Value>>,
}

impl ChatInput {
    /// Rebuild from the serializable wire portion; the parent re-attaches
    /// its own sinks.
    pub fn from_payload(payload: ChatRequestPayload) -> Self {
        Self {
            params: payload.params,
            messages: payload.messages,
            tools: payload.tools,
            stream: payload.stream,
            ..Default::default()
        }
    }

    /// The serializable portion that crosses the bridge.
    pub fn to_payload(&self) -> ChatRequestPayload {
        ChatRequestPayload {
            params: self.params.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
            stream: self.stream,
        }
    }
}

/// Input to a responses-shaped model call.
#[derive(Clone, Debug, Default)]
pub struct ResponsesInput {
    pub params: ModelParams,
    pub items: Vec<ResponseItem>,
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    pub on_stream_event: Option<mpsc::Sender<serde_json::Value>>,
    pub on_trace_event: Option<mpsc::Sender<serde_json::Value>>,
}

impl ResponsesInput {
    pub fn from_payload(payload: ResponsesRequestPayload) -> Self {
        Self {
            params: payload.params,
            items: payload.items,
            tools: payload.tools,
            stream: payload.stream,
            ..Default::default()
        }
    }

    pub fn to_payload(&self) -> ResponsesRequestPayload {
        ResponsesRequestPayload {
            params: self.params.clone(),
            items: self.items.clone(),
            tools: self.tools.clone(),
            stream: self.stream,
        }
    }
}
