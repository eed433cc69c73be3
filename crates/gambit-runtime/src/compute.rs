//! Compute worker — runs decks backed by a native executor.

use crate::bridge::WorkerLink;
use crate::context::ExecutionContext;
use crate::executor::ExecutorRegistry;
use gambit_core::error::{Error, Result};
use gambit_core::protocol::{new_id, RunStartOptions};
use gambit_core::schema::Schema;
use gambit_core::state::SavedState;
use gambit_core::types::RunResult;
use gambit_deck::LoadedDeck;
use gambit_sandbox::PermissionSet;
use tracing::{debug, warn};

pub(crate) async fn run_compute(
    link: &mut WorkerLink,
    deck: &LoadedDeck,
    executors: &ExecutorRegistry,
    permissions: &PermissionSet,
    options: &RunStartOptions,
) -> Result<(RunResult, SavedState)> {
    let executor_ref = deck
        .executor
        .as_ref()
        .ok_or_else(|| Error::Internal("compute worker started without an executor".to_string()))?;
    let executor = executors.resolve(&executor_ref.key).ok_or_else(|| {
        Error::UnsupportedFeature(format!(
            "no registered executor for `{}`",
            executor_ref.key
        ))
    })?;

    if deck.model_params.is_some() {
        warn!(deck = %deck.path.display(), "modelParams ignored on an executor deck");
    }

    // An executor's declared schemas and any prompt-declared ones (deck
    // front matter or the spawning action) must agree structurally;
    // divergence is a warning pre-1.0 and the prompt-declared schema wins.
    let prompt_context = match &deck.context_schema {
        Some(schema) => Some(schema.clone()),
        None => options
            .context_schema
            .clone()
            .map(Schema::from_value)
            .transpose()?,
    };
    let prompt_response = match &deck.response_schema {
        Some(schema) => Some(schema.clone()),
        None => options
            .response_schema
            .clone()
            .map(Schema::from_value)
            .transpose()?,
    };
    let context_schema = bind_schema(
        executor.context_schema(),
        prompt_context.as_ref(),
        "contextSchema",
        &executor_ref.key,
    )?;
    let response_schema = bind_schema(
        executor.response_schema(),
        prompt_response.as_ref(),
        "responseSchema",
        &executor_ref.key,
    )?;

    if options.depth > 0 && (context_schema.is_none() || response_schema.is_none()) {
        return Err(Error::invalid_deck(
            executor_ref.key.clone(),
            "non-root decks must declare both contextSchema and responseSchema",
        ));
    }

    let input = validate_input(&context_schema, options)?;

    let mut state = options.saved_state.clone().unwrap_or_default();
    state.hydrate();
    if state.run_id.is_empty() {
        state.run_id = new_id("run");
    }
    link.publish_state(&state).await?;

    debug!(
        executor = %executor_ref.key,
        depth = options.depth,
        run_id = %state.run_id,
        "executor starting"
    );

    let mut ctx = ExecutionContext {
        link: &mut *link,
        state: &mut state,
        deck_dir: executor_ref.base_dir.clone(),
        permissions: permissions.clone(),
        action_call_id: options.action_call_id.clone(),
        parent_action_call_id: options.parent_action_call_id.clone(),
        depth: options.depth,
        input,
        initial_user_message: options.initial_user_message.clone(),
        label: options.label.clone(),
    };

    let value = executor.execute(&mut ctx).await?;
    link.check_deadline()?;

    let value = validate_output(&response_schema, value, options)?;
    Ok((RunResult::Value { value }, state))
}

/// Pick the effective schema for one side of the executor contract.
fn bind_schema(
    declared: Option<serde_json::Value>,
    prompt: Option<&Schema>,
    kind: &str,
    key: &str,
) -> Result<Option<Schema>> {
    let declared = declared.map(Schema::from_value).transpose()?;
    match (prompt, declared) {
        (Some(prompt), Some(declared)) => {
            if !prompt.structurally_eq(&declared) {
                warn!(executor = %key, kind, "executor-declared schema diverges from the prompt-declared one");
            }
            Ok(Some(prompt.clone()))
        }
        (Some(prompt), None) => Ok(Some(prompt.clone())),
        (None, declared) => Ok(declared),
    }
}

fn validate_input(schema: &Option<Schema>, options: &RunStartOptions) -> Result<serde_json::Value> {
    let mut input = options.input.clone();
    if options.depth == 0 && input.is_null() {
        input = serde_json::Value::String(String::new());
    }
    match schema {
        None => Ok(input),
        Some(schema) => match schema.parse(&input) {
            Ok(value) => Ok(value),
            Err(_) if options.depth == 0 && options.allow_root_string_input && input.is_string() => {
                Ok(input)
            }
            Err(e) => Err(e.into()),
        },
    }
}

fn validate_output(
    schema: &Option<Schema>,
    value: serde_json::Value,
    options: &RunStartOptions,
) -> Result<serde_json::Value> {
    match schema {
        Some(schema) => Ok(schema.parse(&value)?),
        None if options.depth == 0 => match value {
            serde_json::Value::String(s) => Ok(serde_json::Value::String(s)),
            other => Ok(serde_json::Value::String(other.to_string())),
        },
        None => Ok(value),
    }
}
