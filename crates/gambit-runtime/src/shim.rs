//! External interface shim — an OpenAI-chat-shaped façade over the loop.

use crate::run::{DeckRuntime, RunDeckOptions};
use gambit_core::error::Result;
use gambit_core::state::SavedState;
use gambit_core::types::{Message, RunResult, ToolDefinition};
use serde::{Deserialize, Serialize};

/// The accepted request shape.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub object: String,
    pub choices: Vec<ChatChoice>,
    /// Runtime extension: the full message history after the run.
    pub gambit: GambitExtension,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GambitExtension {
    pub messages: Vec<Message>,
}

/// Run a deck against a chat-completion request. The deck body is
/// injected as the system message (a caller-supplied one is overridden
/// with a warning inside the loop); external tool calls surface through
/// `finish_reason: "tool_calls"`.
pub async fn chat_completions(
    runtime: &DeckRuntime,
    deck_path: &str,
    request: ChatCompletionRequest,
) -> Result<ChatCompletionResponse> {
    let mut state = SavedState::new("");
    state.messages = request.messages;

    let mut options = RunDeckOptions::new(deck_path, serde_json::Value::Null);
    options.saved_state = Some(state);
    options.external_tools = request.tools;
    options.model = request.model;

    let outcome = runtime.run_deck(options).await?;
    let (message, finish_reason) = match outcome.result {
        RunResult::Text { text } => (Message::assistant(text), "stop"),
        RunResult::Responded { payload, .. } => {
            let content = match payload {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (Message::assistant(content), "stop")
        }
        RunResult::Ended { message, .. } => {
            (Message::assistant(message.unwrap_or_default()), "stop")
        }
        RunResult::ToolCalls { calls } => (
            Message::assistant_with_tools(String::new(), calls),
            "tool_calls",
        ),
        RunResult::Value { value } => {
            let content = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (Message::assistant(content), "stop")
        }
    };

    Ok(ChatCompletionResponse {
        object: "chat.completion".to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: finish_reason.to_string(),
        }],
        gambit: GambitExtension {
            messages: outcome.state.messages,
        },
    })
}

impl DeckRuntime {
    /// See [`chat_completions`].
    pub async fn chat_completions(
        &self,
        deck_path: &str,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        chat_completions(self, deck_path, request).await
    }
}
