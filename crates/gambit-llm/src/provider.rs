//! Model provider trait

use crate::types::{ChatInput, ResponsesInput};
use gambit_core::protocol::{ResolvedModel, ResponsesResultPayload};
use gambit_core::types::ChatTurn;

/// Result type for provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Provider error types
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("cancelled")]
    Cancelled,
}

/// The one external collaborator that is part of the boundary. The
/// orchestration loop only ever talks to this trait; a production
/// implementation wraps an HTTP client, tests use [`crate::MockProvider`].
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One chat-shaped turn: `finish_reason ∈ {stop, tool_calls, length}`.
    async fn chat(&self, input: ChatInput) -> ProviderResult<ChatTurn>;

    /// One responses-shaped turn, returning the item list.
    async fn responses(&self, input: ResponsesInput) -> ProviderResult<ResponsesResultPayload>;

    /// Map a model id to the provider's concrete model and default params.
    async fn resolve_model(&self, id: &str) -> ProviderResult<ResolvedModel>;
}
