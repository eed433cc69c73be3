//! Gambit Runtime - worker bridge, compute and orchestration workers, and
//! the `run_deck` / chat-completions entry points.

pub mod bridge;
pub mod compute;
pub mod context;
pub mod executor;
pub mod orchestrator;
pub mod run;
pub mod shim;
pub mod worker;

pub use bridge::{WorkerClient, DEFAULT_STATUS_DELAY_MS};
pub use context::{ExecutionContext, SpawnOptions};
pub use executor::{DeckExecutor, ExecutorRegistry};
pub use run::{DeckRuntime, RunDeckOptions, RunOutcome, RuntimeConfig};
pub use shim::{chat_completions, ChatCompletionRequest, ChatCompletionResponse};
