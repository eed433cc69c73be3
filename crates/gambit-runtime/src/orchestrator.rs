//! Orchestration worker — the bounded state machine for model-driven
//! decks.
//!
//! States: Start → Turn → AwaitModel → Dispatch → (Turn | Finalize).
//! Model I/O is proxied to the parent over the bridge; tool calls that
//! match deck actions become nested spawns; anything else bubbles to the
//! caller as the terminal result.

use crate::bridge::{BusyPing, ChatOutcome, ResponsesOutcome, WorkerLink};
use crate::executor::ExecutorRegistry;
use gambit_core::error::{Error, Result};
use gambit_core::protocol::{
    new_id, ChatRequestPayload, ResponsesRequestPayload, RunStartOptions, SpawnRequestPayload,
};
use gambit_core::state::{derive_messages, ContentPart, ResponseItem, SavedState};
use gambit_core::types::{
    FinishReason, Message, ModelParams, Role, RunResult, ToolCall, ToolDefinition,
};
use gambit_deck::{load_deck, ActionTarget, LoadedAction, LoadedDeck};
use serde_json::json;
use tracing::{debug, warn};

pub(crate) async fn run_orchestration(
    link: &mut WorkerLink,
    deck: &LoadedDeck,
    executors: &ExecutorRegistry,
    options: &RunStartOptions,
) -> Result<(RunResult, SavedState)> {
    // --- Start: compose the message list --------------------------------
    if options.depth > 0 && (deck.context_schema.is_none() || deck.response_schema.is_none()) {
        return Err(Error::invalid_deck(
            deck.path.display().to_string(),
            "non-root decks must declare both contextSchema and responseSchema",
        ));
    }

    let mut state = options.saved_state.clone().unwrap_or_default();
    state.hydrate();
    if state.run_id.is_empty() {
        state.run_id = new_id("run");
    }
    seed_system_prompt(&mut state, &deck.body);

    let input = validate_input(deck, options)?;
    let has_conversation = state.messages.iter().any(|m| m.role != Role::System);
    if !has_conversation {
        if let Some(text) = &options.initial_user_message {
            state.messages.push(Message::user(text.clone()));
        } else if !input.is_null() {
            state.messages.push(Message::user(value_as_text(&input)));
        }
    }
    link.publish_state(&state).await?;

    // --- Turn: build the tool catalog -----------------------------------
    let tools = build_tool_catalog(deck, executors, options)?;
    let params = resolve_params(link, deck, options).await?;

    let busy = deck.handlers.on_busy.as_ref().map(|h| BusyPing {
        path: h.path.display().to_string(),
        repeat_ms: h.repeat_ms,
        run_id: state.run_id.clone(),
    });

    let max_passes = deck
        .guardrails
        .map(|g| g.max_passes)
        .unwrap_or(options.guardrails.max_passes);

    // Item-centric decks drive the responses API instead of chat.
    if deck.start_mode.as_deref() == Some("responses") {
        return run_responses_mode(link, deck, options, state, tools, params, busy, max_passes)
            .await;
    }

    let mut passes: u32 = 0;

    loop {
        link.check_deadline()?;
        if passes >= max_passes {
            return Err(Error::PassesExceeded { max: max_passes });
        }
        passes += 1;

        // --- AwaitModel --------------------------------------------------
        let payload = ChatRequestPayload {
            params: params.clone(),
            messages: state.messages.clone(),
            tools: tools.clone(),
            stream: true,
        };
        let turn = match link.request_chat(payload, busy.clone()).await? {
            ChatOutcome::Turn { turn, progressed } => {
                if progressed && turn.message.content.is_empty() {
                    debug!(pass = passes, "streamed text arrived with an empty final message");
                }
                turn
            }
            ChatOutcome::ModelError {
                message,
                progressed,
            } => {
                // A failed pass that produced partial output does not
                // count against the budget; a silent failure does.
                if progressed {
                    passes = passes.saturating_sub(1);
                }
                warn!(pass = passes, "model error surfaced to loop: {}", message);
                continue;
            }
        };

        // --- Dispatch ----------------------------------------------------
        let calls = turn
            .tool_calls
            .clone()
            .or_else(|| turn.message.tool_calls.clone())
            .unwrap_or_default();

        if turn.finish_reason == FinishReason::ToolCalls && !calls.is_empty() {
            let mut assistant = turn.message.clone();
            assistant.tool_calls = Some(calls.clone());
            state.messages.push(assistant);
            link.publish_state(&state).await?;

            if let Some(result) =
                dispatch_calls(link, deck, options, &mut state, &calls).await?
            {
                fire_idle(link, deck, &state, passes).await;
                return Ok((result, state));
            }

            fire_idle(link, deck, &state, passes).await;
            continue;
        }

        // --- Finalize ----------------------------------------------------
        let text = turn.message.content.clone();
        state.messages.push(Message::assistant(text.clone()));
        link.publish_state(&state).await?;
        fire_idle(link, deck, &state, passes).await;
        return Ok((RunResult::Text { text }, state));
    }
}

/// The deck body is the system prompt; a conflicting caller-supplied
/// system message warns and loses.
fn seed_system_prompt(state: &mut SavedState, body: &str) {
    match state.messages.iter().position(|m| m.role == Role::System) {
        Some(index) => {
            if state.messages[index].content != body {
                warn!("caller-supplied system message overridden by the deck prompt");
            }
            state.messages[index] = Message::system(body.to_string());
        }
        None => state.messages.insert(0, Message::system(body.to_string())),
    }
}

fn validate_input(deck: &LoadedDeck, options: &RunStartOptions) -> Result<serde_json::Value> {
    let mut input = options.input.clone();
    if options.depth == 0 && input.is_null() {
        return Ok(serde_json::Value::Null);
    }
    match &deck.context_schema {
        None => Ok(input),
        Some(schema) => match schema.parse(&input) {
            Ok(value) => Ok(value),
            Err(_) if options.depth == 0 && options.allow_root_string_input && input.is_string() => {
                Ok(input.take())
            }
            Err(e) => Err(e.into()),
        },
    }
}

fn value_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Deck actions plus responder builtins plus the caller's external tools.
/// A name shared between an action and an external tool fails before any
/// model call.
fn build_tool_catalog(
    deck: &LoadedDeck,
    executors: &ExecutorRegistry,
    options: &RunStartOptions,
) -> Result<Vec<ToolDefinition>> {
    let mut tools = Vec::new();
    for action in &deck.actions {
        tools.push(ToolDefinition {
            name: action.name.clone(),
            description: action.description.clone(),
            parameters: action_parameters(action, executors),
        });
    }

    if deck.respond {
        let payload_schema = deck
            .response_schema
            .as_ref()
            .map(|s| s.raw().clone())
            .unwrap_or_else(|| json!({"type": "object"}));
        tools.push(ToolDefinition {
            name: "gambit_respond".to_string(),
            description: "Finalize this run with a structured payload.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "payload": payload_schema,
                    "status": {"type": "string"},
                    "message": {"type": "string"},
                    "code": {"type": "string"},
                    "meta": {"type": "object"}
                },
                "required": ["payload"]
            }),
        });
    }
    if deck.allow_end {
        tools.push(ToolDefinition {
            name: "gambit_end".to_string(),
            description: "End the session when no further work is possible.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "payload": {}
                }
            }),
        });
    }

    for external in &options.external_tools {
        if deck.find_action(&external.name).is_some() {
            return Err(Error::ToolNameCollision {
                name: external.name.clone(),
            });
        }
        tools.push(external.clone());
    }
    Ok(tools)
}

/// Tool parameters for an action: the child deck's context schema, the
/// action's own declaration, or the registered executor's, in that order.
fn action_parameters(action: &LoadedAction, executors: &ExecutorRegistry) -> serde_json::Value {
    if let Some(schema) = &action.context_schema {
        return schema.raw().clone();
    }
    match &action.target {
        ActionTarget::Deck(path) => load_deck(path)
            .ok()
            .and_then(|child| child.context_schema.map(|s| s.raw().clone()))
            .unwrap_or_else(|| json!({"type": "object"})),
        ActionTarget::Executor(key) => executors
            .resolve(key)
            .and_then(|e| e.context_schema())
            .unwrap_or_else(|| json!({"type": "object"})),
    }
}

async fn resolve_params(
    link: &mut WorkerLink,
    deck: &LoadedDeck,
    options: &RunStartOptions,
) -> Result<ModelParams> {
    let mut params = deck.model_params.clone().unwrap_or_default();
    if params.model.is_none() {
        params.model = options.model.clone();
    }
    if let Some(id) = params.model.clone() {
        let resolved = link.request_resolve_model(&id).await?;
        params.model = Some(resolved.model);
        if let Some(defaults) = resolved.params {
            params.temperature = params.temperature.or(defaults.temperature);
            params.top_p = params.top_p.or(defaults.top_p);
            params.max_tokens = params.max_tokens.or(defaults.max_tokens);
        }
    }
    Ok(params)
}

/// Work through one assistant message's tool calls in order. Returns the
/// terminal result when a responder builtin or external bubbling ends the
/// run, `None` to continue with the next pass.
async fn dispatch_calls(
    link: &mut WorkerLink,
    deck: &LoadedDeck,
    options: &RunStartOptions,
    state: &mut SavedState,
    calls: &[ToolCall],
) -> Result<Option<RunResult>> {
    let mut externals: Vec<ToolCall> = Vec::new();
    let mut index = 0;

    while index < calls.len() {
        let call = &calls[index];
        let name = call.function.name.as_str();

        if name == "gambit_respond" {
            return Ok(Some(finalize_respond(deck, call)?));
        }
        if name == "gambit_end" {
            if deck.allow_end {
                return Ok(Some(finalize_end(call)?));
            }
            warn!("gambit_end called on a deck that does not allow ending");
            state.messages.push(Message::tool_result(
                call.id.clone(),
                name,
                "ending is not allowed for this deck",
            ));
            link.publish_state(state).await?;
            index += 1;
            continue;
        }

        if let Some(action) = deck.find_action(name) {
            // Consecutive parallel-marked actions dispatch as one batch.
            let mut group = vec![index];
            if action.parallel {
                let mut next = index + 1;
                while next < calls.len() {
                    match deck.find_action(&calls[next].function.name) {
                        Some(a) if a.parallel => {
                            group.push(next);
                            next += 1;
                        }
                        _ => break,
                    }
                }
            }

            let mut payloads = Vec::with_capacity(group.len());
            for &i in &group {
                payloads.push(spawn_payload(deck, &calls[i], options)?);
            }
            let results = link.request_spawn_batch(payloads).await?;

            for (&i, result) in group.iter().zip(results) {
                let call = &calls[i];
                let content = match result {
                    Ok(child) => child.to_tool_content(),
                    Err(err @ Error::Remote { .. }) if is_guardrail(&err) => return Err(err),
                    Err(Error::Timeout) => return Err(Error::Timeout),
                    Err(err) => json!({"error": {"name": err.name(), "message": err.to_string()}})
                        .to_string(),
                };
                state.messages.push(Message::tool_result(
                    call.id.clone(),
                    call.function.name.clone(),
                    content,
                ));
                link.publish_state(state).await?;
            }
            index = group.last().expect("group is non-empty") + 1;
            continue;
        }

        // Not ours: bubble to the caller.
        externals.push(call.clone());
        index += 1;
    }

    if !externals.is_empty() {
        return Ok(Some(RunResult::ToolCalls { calls: externals }));
    }
    Ok(None)
}

fn spawn_payload(
    deck: &LoadedDeck,
    call: &ToolCall,
    _options: &RunStartOptions,
) -> Result<SpawnRequestPayload> {
    let action = deck
        .find_action(&call.function.name)
        .ok_or_else(|| Error::Internal("dispatch on unknown action".to_string()))?;
    let path = match &action.target {
        ActionTarget::Deck(path) => path.display().to_string(),
        ActionTarget::Executor(key) => key.clone(),
    };
    Ok(SpawnRequestPayload {
        path,
        name: Some(action.name.clone()),
        input: call.parse_arguments()?,
        label: action.label.clone(),
        action_call_id: Some(call.id.clone()),
    })
}

fn finalize_respond(deck: &LoadedDeck, call: &ToolCall) -> Result<RunResult> {
    let args = call.parse_arguments()?;
    let payload = args.get("payload").cloned().unwrap_or(serde_json::Value::Null);
    let payload = match &deck.response_schema {
        Some(schema) => schema.parse(&payload)?,
        None => payload,
    };
    Ok(RunResult::Responded {
        status: args
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("ok")
            .to_string(),
        message: args
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        code: args.get("code").and_then(|v| v.as_str()).map(str::to_string),
        meta: args.get("meta").cloned(),
        payload,
    })
}

fn finalize_end(call: &ToolCall) -> Result<RunResult> {
    let args = call.parse_arguments()?;
    Ok(RunResult::Ended {
        message: args
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        payload: args.get("payload").cloned(),
    })
}

/// The responses-shaped rendition of the loop: the session is item-centric
/// and both state shapes are kept in lockstep, so
/// `derive_messages(items) == messages` holds by construction.
#[allow(clippy::too_many_arguments)]
async fn run_responses_mode(
    link: &mut WorkerLink,
    deck: &LoadedDeck,
    options: &RunStartOptions,
    mut state: SavedState,
    tools: Vec<ToolDefinition>,
    params: ModelParams,
    busy: Option<BusyPing>,
    max_passes: u32,
) -> Result<(RunResult, SavedState)> {
    let mut items = state
        .items
        .clone()
        .unwrap_or_else(|| items_from_messages(&state.messages));
    let mut passes: u32 = 0;

    loop {
        link.check_deadline()?;
        if passes >= max_passes {
            return Err(Error::PassesExceeded { max: max_passes });
        }
        passes += 1;

        let payload = ResponsesRequestPayload {
            params: params.clone(),
            items: items.clone(),
            tools: tools.clone(),
            stream: true,
        };
        let result = match link.request_responses(payload, busy.clone()).await? {
            ResponsesOutcome::Items { result, .. } => result,
            ResponsesOutcome::ModelError {
                message,
                progressed,
            } => {
                if progressed {
                    passes = passes.saturating_sub(1);
                }
                warn!(pass = passes, "model error surfaced to loop: {}", message);
                continue;
            }
        };

        let new_items = result.items;
        items.extend(new_items.iter().cloned());
        sync_item_state(&mut state, &items);
        link.publish_state(&state).await?;

        let calls: Vec<ToolCall> = new_items
            .iter()
            .filter_map(|item| match item {
                ResponseItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                    ..
                } => Some(ToolCall::function(call_id, name, arguments)),
                _ => None,
            })
            .collect();

        if calls.is_empty() {
            let text = new_items
                .iter()
                .rev()
                .find_map(|item| match item {
                    ResponseItem::Message {
                        role: Role::Assistant,
                        content,
                        ..
                    } => Some(content.iter().map(|p| p.text.as_str()).collect::<String>()),
                    _ => None,
                })
                .unwrap_or_default();
            fire_idle(link, deck, &state, passes).await;
            return Ok((RunResult::Text { text }, state));
        }

        let mut externals = Vec::new();
        for call in &calls {
            let name = call.function.name.as_str();
            if name == "gambit_respond" {
                return Ok((finalize_respond(deck, call)?, state));
            }
            if name == "gambit_end" && deck.allow_end {
                return Ok((finalize_end(call)?, state));
            }
            if deck.find_action(name).is_some() {
                let payload = spawn_payload(deck, call, options)?;
                let output = match link.request_spawn(payload).await {
                    Ok(child) => child.to_tool_content(),
                    Err(err) if is_guardrail(&err) => return Err(err),
                    Err(Error::Timeout) => return Err(Error::Timeout),
                    Err(err) => json!({"error": {"name": err.name(), "message": err.to_string()}})
                        .to_string(),
                };
                items.push(ResponseItem::FunctionCallOutput {
                    call_id: call.id.clone(),
                    output,
                    id: None,
                });
                sync_item_state(&mut state, &items);
                link.publish_state(&state).await?;
            } else {
                externals.push(call.clone());
            }
        }

        fire_idle(link, deck, &state, passes).await;
        if !externals.is_empty() {
            return Ok((RunResult::ToolCalls { calls: externals }, state));
        }
    }
}

fn sync_item_state(state: &mut SavedState, items: &[ResponseItem]) {
    state.items = Some(items.to_vec());
    state.messages = derive_messages(items);
}

/// Inverse projection used to seed a responses run from chat history.
fn items_from_messages(messages: &[Message]) -> Vec<ResponseItem> {
    let mut items = Vec::new();
    for message in messages {
        match message.role {
            Role::Tool => items.push(ResponseItem::FunctionCallOutput {
                call_id: message.tool_call_id.clone().unwrap_or_default(),
                output: message.content.clone(),
                id: None,
            }),
            role => {
                if !message.content.is_empty() {
                    items.push(ResponseItem::Message {
                        role,
                        content: vec![ContentPart::text(message.content.clone())],
                        id: None,
                    });
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        items.push(ResponseItem::FunctionCall {
                            call_id: call.id.clone(),
                            name: call.function.name.clone(),
                            arguments: call.function.arguments.clone(),
                            id: None,
                        });
                    }
                }
            }
        }
    }
    items
}

fn is_guardrail(err: &Error) -> bool {
    matches!(
        err.code().as_deref(),
        Some("depth_exceeded") | Some("passes_exceeded") | Some("timeout")
    )
}

async fn fire_idle(link: &WorkerLink, deck: &LoadedDeck, state: &SavedState, passes: u32) {
    if let Some(handler) = &deck.handlers.on_idle {
        let _ = link
            .spawn_detached(SpawnRequestPayload {
                path: handler.path.display().to_string(),
                name: None,
                input: json!({"status": "idle", "runId": state.run_id, "passes": passes}),
                label: Some("onIdle".to_string()),
                action_call_id: None,
            })
            .await;
    }
}

/// Fire the `onError` handler, then let the caller post `run.error`.
pub(crate) async fn fire_error_handler(link: &WorkerLink, deck: &LoadedDeck, error: &Error) {
    if let Some(handler) = &deck.handlers.on_error {
        let _ = link
            .spawn_detached(SpawnRequestPayload {
                path: handler.path.display().to_string(),
                name: None,
                input: json!({
                    "status": "error",
                    "error": {"name": error.name(), "message": error.to_string(), "code": error.code()}
                }),
                label: Some("onError".to_string()),
                action_call_id: None,
            })
            .await;
    }
}
