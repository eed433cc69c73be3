//! Gambit LLM - the model provider boundary.
//!
//! The concrete provider lives outside this workspace; everything here is
//! the contract it must satisfy plus a scriptable mock for tests.

pub mod mock;
pub mod provider;
pub mod types;

pub use mock::MockProvider;
pub use provider::{ModelProvider, ProviderError, ProviderResult};
pub use types::{ChatInput, ResponsesInput};
