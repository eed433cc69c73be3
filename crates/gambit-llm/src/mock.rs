//! Scriptable provider for tests — queued turns in, recorded requests out.

use crate::provider::{ModelProvider, ProviderError, ProviderResult};
use crate::types::{ChatInput, ResponsesInput};
use gambit_core::protocol::{
    ChatRequestPayload, ResolvedModel, ResponsesRequestPayload, ResponsesResultPayload,
};
use gambit_core::types::ChatTurn;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// A provider that replays scripted turns and records every request it
/// received, in order.
#[derive(Default)]
pub struct MockProvider {
    chat_turns: Mutex<VecDeque<ChatTurn>>,
    response_turns: Mutex<VecDeque<ResponsesResultPayload>>,
    chat_requests: Mutex<Vec<ChatRequestPayload>>,
    responses_requests: Mutex<Vec<ResponsesRequestPayload>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next chat turn.
    pub fn push_turn(&self, turn: ChatTurn) {
        self.chat_turns.lock().unwrap().push_back(turn);
    }

    pub fn push_responses(&self, result: ResponsesResultPayload) {
        self.response_turns.lock().unwrap().push_back(result);
    }

    /// Every chat request observed so far.
    pub fn chat_requests(&self) -> Vec<ChatRequestPayload> {
        self.chat_requests.lock().unwrap().clone()
    }

    pub fn chat_request_count(&self) -> usize {
        self.chat_requests.lock().unwrap().len()
    }

    pub fn responses_requests(&self) -> Vec<ResponsesRequestPayload> {
        self.responses_requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, input: ChatInput) -> ProviderResult<ChatTurn> {
        self.chat_requests.lock().unwrap().push(input.to_payload());

        let turn = self
            .chat_turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::RequestFailed("mock turn queue empty".to_string()))?;

        if input.stream {
            if let Some(sink) = &input.on_stream_text {
                if !turn.message.content.is_empty() {
                    let _ = sink.send(turn.message.content.clone()).await;
                }
            }
        }
        debug!(finish = turn.finish_reason.as_str(), "mock chat turn served");
        Ok(turn)
    }

    async fn responses(&self, input: ResponsesInput) -> ProviderResult<ResponsesResultPayload> {
        self.responses_requests
            .lock()
            .unwrap()
            .push(input.to_payload());
        self.response_turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::RequestFailed("mock responses queue empty".to_string()))
    }

    async fn resolve_model(&self, id: &str) -> ProviderResult<ResolvedModel> {
        Ok(ResolvedModel {
            model: id.to_string(),
            params: None,
        })
    }
}
