//! The full orchestration entry — `run_deck` and the parent-side drive.
//!
//! The parent owns the model provider and the executor registry, resolves
//! effective permissions, spawns workers, and serves their model and
//! spawn requests. Children are recursive invocations of the same drive
//! with a tightened permission set and the parent's deadline.

use crate::bridge::{WorkerClient, WorkerLink};
use crate::executor::ExecutorRegistry;
use crate::worker::worker_main;
use futures::future::BoxFuture;
use gambit_core::error::{Error, ErrorPayload, Result};
use gambit_core::protocol::{
    new_id, ChatRequestPayload, ParentMessage, ResponsesRequestPayload, RunStartOptions,
    SpawnRequestPayload, WorkerMessage,
};
use gambit_core::state::SavedState;
use gambit_core::types::{Guardrails, RunResult, ToolDefinition};
use gambit_deck::{load_deck, LoadedAction, LoadedDeck};
use gambit_llm::{ChatInput, ModelProvider, ResponsesInput};
use gambit_sandbox::{LayerTrace, PermissionDecl, PermissionSet, SandboxSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime-wide configuration: the workspace and session permission
/// layers plus guardrail defaults for decks that declare none.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub workspace_root: PathBuf,
    pub workspace_permissions: Option<PermissionDecl>,
    pub session_permissions: Option<PermissionDecl>,
    pub guardrails: Guardrails,
    pub allow_root_string_input: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::current_dir().unwrap_or_default(),
            workspace_permissions: None,
            session_permissions: None,
            guardrails: Guardrails::default(),
            allow_root_string_input: false,
        }
    }
}

/// Options for one root invocation.
#[derive(Clone, Default)]
pub struct RunDeckOptions {
    pub deck_path: String,
    pub input: serde_json::Value,
    pub saved_state: Option<SavedState>,
    pub external_tools: Vec<ToolDefinition>,
    pub label: Option<String>,
    pub model: Option<String>,
    pub initial_user_message: Option<String>,
    pub on_stream_text: Option<mpsc::Sender<String>>,
    pub on_state_update: Option<mpsc::Sender<SavedState>>,
    pub on_trace_event: Option<mpsc::Sender<serde_json::Value>>,
    pub cancel: Option<CancellationToken>,
}

impl RunDeckOptions {
    pub fn new(deck_path: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            deck_path: deck_path.into(),
            input,
            ..Default::default()
        }
    }
}

/// Result of one root invocation.
#[derive(Debug)]
pub struct RunOutcome {
    pub result: RunResult,
    pub state: SavedState,
    pub permission_trace: Vec<LayerTrace>,
}

#[derive(Clone, Default)]
struct RunHooks {
    stream: Option<mpsc::Sender<String>>,
    state: Option<mpsc::Sender<SavedState>>,
    trace_sink: Option<mpsc::Sender<serde_json::Value>>,
}

/// The orchestration runtime.
#[derive(Clone)]
pub struct DeckRuntime {
    provider: Arc<dyn ModelProvider>,
    executors: Arc<ExecutorRegistry>,
    config: Arc<RuntimeConfig>,
}

impl DeckRuntime {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        executors: ExecutorRegistry,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            provider,
            executors: Arc::new(executors),
            config: Arc::new(config),
        }
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run a deck to its terminal result.
    pub async fn run_deck(&self, options: RunDeckOptions) -> Result<RunOutcome> {
        let deck = load_deck(&options.deck_path)?;
        let (effective, trace) = self.resolve_root_permissions(&deck)?;

        let guardrails = deck.guardrails.unwrap_or(self.config.guardrails);
        let run_deadline_ms = guardrails.deadline_from_now();

        let start = RunStartOptions {
            deck_path: options.deck_path.clone(),
            input: options.input.clone(),
            depth: 0,
            action_call_id: new_id("call"),
            parent_action_call_id: None,
            label: options.label.clone(),
            model: options.model.clone(),
            saved_state: options.saved_state.clone(),
            external_tools: options.external_tools.clone(),
            guardrails,
            run_deadline_ms,
            allow_root_string_input: self.config.allow_root_string_input,
            initial_user_message: options.initial_user_message.clone(),
            context_schema: None,
            response_schema: None,
        };
        let hooks = RunHooks {
            stream: options.on_stream_text.clone(),
            state: options.on_state_update.clone(),
            trace_sink: options.on_trace_event.clone(),
        };
        let cancel = options.cancel.clone().unwrap_or_default();

        info!(deck = %options.deck_path, deadline_ms = run_deadline_ms, "root run starting");
        let (result, state) = self
            .clone()
            .drive(deck, effective, start, hooks, cancel)
            .await?;
        Ok(RunOutcome {
            result,
            state,
            permission_trace: trace,
        })
    }

    /// Inspect a deck inside a worker without running it.
    pub async fn inspect_deck(&self, path: &str) -> Result<serde_json::Value> {
        let session = new_id("bridge");
        let (to_worker_tx, to_worker_rx) = mpsc::channel(16);
        let (to_parent_tx, to_parent_rx) = mpsc::channel(16);
        let link = WorkerLink::new(session.clone(), to_worker_rx, to_parent_tx);
        let effective = PermissionSet::unrestricted(&self.config.workspace_root);
        let sandbox = SandboxSpec::from_effective(&effective);
        tokio::spawn(worker_main(link, self.executors.clone(), effective, sandbox));

        let client = WorkerClient::new(session, to_worker_tx, to_parent_rx);
        client.inspect(path).await
    }

    /// Fold the root layers: implicit host, workspace, deck declaration,
    /// session.
    fn resolve_root_permissions(
        &self,
        deck: &LoadedDeck,
    ) -> Result<(PermissionSet, Vec<LayerTrace>)> {
        let ws = &self.config.workspace_root;
        let mut effective = PermissionSet::unrestricted(ws.clone());
        let mut trace = vec![LayerTrace::new("host", &effective)];

        if let Some(decl) = &self.config.workspace_permissions {
            let set = PermissionSet::from_decl(decl, ws)
                .map_err(|e| Error::PermissionDenied(e.to_string()))?;
            trace.push(LayerTrace::new("workspace", &set));
            effective = effective.intersect(&set);
        }
        if let Some(set) = &deck.permissions {
            trace.push(LayerTrace::new("declaration", set));
            effective = effective.intersect(set);
        }
        if let Some(decl) = &self.config.session_permissions {
            let set = PermissionSet::from_decl(decl, ws)
                .map_err(|e| Error::PermissionDenied(e.to_string()))?;
            trace.push(LayerTrace::new("session", &set));
            effective = effective.intersect(&set);
        }
        effective.base_dir = deck.dir().to_path_buf();
        Ok((effective, trace))
    }

    /// Spawn a worker for one run and multiplex its bridge until the
    /// terminal reply. Boxed for recursion through child spawns.
    fn drive(
        self,
        deck: LoadedDeck,
        effective: PermissionSet,
        start: RunStartOptions,
        hooks: RunHooks,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(RunResult, SavedState)>> {
        Box::pin(async move {
            let session = new_id("bridge");
            let nonce = new_id("nonce");
            let (to_worker_tx, to_worker_rx) = mpsc::channel(64);
            let (to_parent_tx, mut to_parent_rx) = mpsc::channel(64);

            let link = WorkerLink::new(session.clone(), to_worker_rx, to_parent_tx);
            let sandbox = SandboxSpec::from_effective(&effective);
            let worker = tokio::spawn(worker_main(
                link,
                self.executors.clone(),
                effective.clone(),
                sandbox,
            ));

            let serve_cancel = cancel.child_token();
            let started = to_worker_tx
                .send(ParentMessage::RunStart {
                    bridge_session: session.clone(),
                    completion_nonce: nonce.clone(),
                    options: start.clone(),
                })
                .await;
            if started.is_err() {
                worker.abort();
                return Err(Error::WorkerTerminated);
            }

            let mut latest_state: Option<SavedState> = None;
            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err(Error::WorkerTerminated),
                    msg = to_parent_rx.recv() => {
                        let msg = match msg {
                            None => break Err(Error::WorkerTerminated),
                            Some(msg) => msg,
                        };
                        if msg.bridge_session() != session {
                            continue;
                        }
                        match msg {
                            WorkerMessage::ModelChatRequest { request_id, payload, .. } => {
                                self.serve_chat(session.clone(), request_id, payload, to_worker_tx.clone());
                            }
                            WorkerMessage::ModelResponsesRequest { request_id, payload, .. } => {
                                self.serve_responses(session.clone(), request_id, payload, to_worker_tx.clone());
                            }
                            WorkerMessage::ModelResolveModelRequest { request_id, model_id, .. } => {
                                self.serve_resolve_model(session.clone(), request_id, model_id, to_worker_tx.clone());
                            }
                            WorkerMessage::SpawnRequest { request_id, payload, .. } => {
                                self.serve_spawn(
                                    &deck,
                                    &effective,
                                    &start,
                                    session.clone(),
                                    request_id,
                                    payload,
                                    to_worker_tx.clone(),
                                    serve_cancel.clone(),
                                );
                            }
                            WorkerMessage::StateUpdate { state, .. } => {
                                latest_state = Some(state.clone());
                                if let Some(sink) = &hooks.state {
                                    let _ = sink.send(state).await;
                                }
                            }
                            WorkerMessage::StreamText { text, .. } => {
                                if let Some(sink) = &hooks.stream {
                                    let _ = sink.send(text).await;
                                }
                            }
                            WorkerMessage::TraceEvent { event, .. } => {
                                if let Some(sink) = &hooks.trace_sink {
                                    let _ = sink.send(event).await;
                                }
                            }
                            WorkerMessage::LogEntry { level, message, .. } => {
                                match level.as_str() {
                                    "error" => warn!(session = %session, "worker: {}", message),
                                    _ => debug!(session = %session, "worker: {}", message),
                                }
                            }
                            WorkerMessage::RunResult { completion_nonce, result, state, .. } => {
                                if completion_nonce != nonce {
                                    debug!("stale run.result discarded");
                                    continue;
                                }
                                if let Some(state) = state {
                                    latest_state = Some(state);
                                }
                                break Ok(result);
                            }
                            WorkerMessage::RunError { completion_nonce, error, .. } => {
                                if completion_nonce != nonce {
                                    debug!("stale run.error discarded");
                                    continue;
                                }
                                break Err(error.into_error());
                            }
                            WorkerMessage::DeckInspectResult { .. }
                            | WorkerMessage::DeckInspectError { .. } => {
                                debug!("inspect reply outside an inspect flow ignored");
                            }
                        }
                    }
                }
            };

            serve_cancel.cancel();
            drop(to_worker_tx);
            worker.abort();

            match outcome {
                Ok(result) => {
                    let state = latest_state.unwrap_or_else(|| SavedState::new(new_id("run")));
                    Ok((result, state))
                }
                Err(e) => Err(e),
            }
        })
    }

    fn serve_chat(
        &self,
        session: String,
        request_id: String,
        payload: ChatRequestPayload,
        to_worker: mpsc::Sender<ParentMessage>,
    ) {
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let mut input = ChatInput::from_payload(payload);

            let (text_tx, mut text_rx) = mpsc::channel::<String>(64);
            let stream_forward = {
                let to_worker = to_worker.clone();
                let session = session.clone();
                let request_id = request_id.clone();
                tokio::spawn(async move {
                    while let Some(text) = text_rx.recv().await {
                        let _ = to_worker
                            .send(ParentMessage::ModelChatStream {
                                bridge_session: session.clone(),
                                request_id: request_id.clone(),
                                text,
                            })
                            .await;
                    }
                })
            };
            let (trace_tx, mut trace_rx) = mpsc::channel::<serde_json::Value>(64);
            let trace_forward = {
                let to_worker = to_worker.clone();
                let session = session.clone();
                let request_id = request_id.clone();
                tokio::spawn(async move {
                    while let Some(event) = trace_rx.recv().await {
                        let _ = to_worker
                            .send(ParentMessage::ModelChatTrace {
                                bridge_session: session.clone(),
                                request_id: request_id.clone(),
                                event,
                            })
                            .await;
                    }
                })
            };

            if input.stream {
                input.on_stream_text = Some(text_tx);
            }
            input.on_trace_event = Some(trace_tx);

            let result = provider.chat(input).await;
            // The provider dropped its sink clones with the input; wait for
            // the forwarders so streamed text precedes the terminal reply.
            let _ = stream_forward.await;
            let _ = trace_forward.await;

            let reply = match result {
                Ok(turn) => ParentMessage::ModelChatResult {
                    bridge_session: session,
                    request_id,
                    turn,
                },
                Err(e) => ParentMessage::ModelChatError {
                    bridge_session: session,
                    request_id,
                    error: provider_error(e),
                },
            };
            let _ = to_worker.send(reply).await;
        });
    }

    fn serve_responses(
        &self,
        session: String,
        request_id: String,
        payload: ResponsesRequestPayload,
        to_worker: mpsc::Sender<ParentMessage>,
    ) {
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::channel::<serde_json::Value>(64);
            let event_forward = {
                let to_worker = to_worker.clone();
                let session = session.clone();
                let request_id = request_id.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        let _ = to_worker
                            .send(ParentMessage::ModelResponsesEvent {
                                bridge_session: session.clone(),
                                request_id: request_id.clone(),
                                event,
                            })
                            .await;
                    }
                })
            };

            let mut input = ResponsesInput::from_payload(payload);
            if input.stream {
                input.on_stream_event = Some(event_tx);
            }

            let result = provider.responses(input).await;
            let _ = event_forward.await;

            let reply = match result {
                Ok(result) => ParentMessage::ModelResponsesResult {
                    bridge_session: session,
                    request_id,
                    result,
                },
                Err(e) => ParentMessage::ModelResponsesError {
                    bridge_session: session,
                    request_id,
                    error: provider_error(e),
                },
            };
            let _ = to_worker.send(reply).await;
        });
    }

    fn serve_resolve_model(
        &self,
        session: String,
        request_id: String,
        model_id: String,
        to_worker: mpsc::Sender<ParentMessage>,
    ) {
        let provider = self.provider.clone();
        tokio::spawn(async move {
            let reply = match provider.resolve_model(&model_id).await {
                Ok(resolved) => ParentMessage::ModelResolveModelResult {
                    bridge_session: session,
                    request_id,
                    resolved,
                },
                Err(e) => ParentMessage::ModelResolveModelError {
                    bridge_session: session,
                    request_id,
                    error: provider_error(e),
                },
            };
            let _ = to_worker.send(reply).await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn serve_spawn(
        &self,
        parent_deck: &LoadedDeck,
        parent_effective: &PermissionSet,
        parent_start: &RunStartOptions,
        session: String,
        request_id: String,
        payload: SpawnRequestPayload,
        to_worker: mpsc::Sender<ParentMessage>,
        cancel: CancellationToken,
    ) {
        let runtime = self.clone();
        let action = payload
            .name
            .as_deref()
            .and_then(|name| parent_deck.find_action(name))
            .cloned();
        let parent_effective = parent_effective.clone();
        let parent_depth = parent_start.depth;
        let guardrails = parent_start.guardrails;
        let deadline = parent_start.run_deadline_ms;
        let parent_call_id = parent_start.action_call_id.clone();

        tokio::spawn(async move {
            let outcome = runtime
                .spawn_child(
                    parent_effective,
                    parent_depth,
                    guardrails,
                    deadline,
                    parent_call_id,
                    action,
                    payload,
                    cancel,
                )
                .await;
            let reply = match outcome {
                Ok((result, _state)) => ParentMessage::SpawnResult {
                    bridge_session: session,
                    request_id,
                    result,
                },
                Err(e) => ParentMessage::SpawnError {
                    bridge_session: session,
                    request_id,
                    error: e.to_payload("parent"),
                },
            };
            let _ = to_worker.send(reply).await;
        });
    }

    /// Resolve and run a nested deck. The child's effective permissions
    /// fold parent, declaration, then the parent's reference narrowing;
    /// the deadline is inherited unchanged.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_child(
        self,
        parent_effective: PermissionSet,
        parent_depth: u32,
        guardrails: Guardrails,
        deadline: u64,
        parent_call_id: String,
        action: Option<LoadedAction>,
        payload: SpawnRequestPayload,
        cancel: CancellationToken,
    ) -> Result<(RunResult, SavedState)> {
        let depth = parent_depth + 1;
        if depth > guardrails.max_depth {
            return Err(Error::DepthExceeded {
                depth,
                max: guardrails.max_depth,
            });
        }

        let child_deck = load_deck(&payload.path)?;
        let mut effective = parent_effective;
        if let Some(set) = &child_deck.permissions {
            effective = effective.intersect(set);
        }
        if let Some(reference) = action.as_ref().and_then(|a| a.permissions.as_ref()) {
            effective = effective.intersect(reference);
        }
        effective.base_dir = child_deck.dir().to_path_buf();

        let start = RunStartOptions {
            deck_path: payload.path,
            input: payload.input,
            depth,
            action_call_id: payload.action_call_id.unwrap_or_else(|| new_id("call")),
            parent_action_call_id: Some(parent_call_id),
            label: payload
                .label
                .or_else(|| action.as_ref().and_then(|a| a.label.clone())),
            model: None,
            saved_state: None,
            external_tools: Vec::new(),
            guardrails,
            run_deadline_ms: deadline,
            allow_root_string_input: false,
            initial_user_message: None,
            context_schema: action
                .as_ref()
                .and_then(|a| a.context_schema.as_ref().map(|s| s.raw().clone())),
            response_schema: action
                .as_ref()
                .and_then(|a| a.response_schema.as_ref().map(|s| s.raw().clone())),
        };

        debug!(deck = %start.deck_path, depth, "child spawn");
        self.drive(child_deck, effective, start, RunHooks::default(), cancel)
            .await
    }
}

fn provider_error(e: gambit_llm::ProviderError) -> ErrorPayload {
    ErrorPayload {
        source: Some("provider".to_string()),
        name: "ModelError".to_string(),
        message: e.to_string(),
        code: None,
    }
}
