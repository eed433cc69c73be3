//! Worker bridge plumbing.
//!
//! Each worker is a tokio task holding the receiving half of a
//! [`WorkerLink`]; the parent drives the other side. A worker is strictly
//! sequential: it issues one request at a time (batched spawns excepted)
//! and filters every inbound message by bridge session and request id.

use gambit_core::error::{Error, ErrorPayload, Result};
use gambit_core::protocol::{
    new_id, ChatRequestPayload, ParentMessage, ResolvedModel, ResponsesRequestPayload,
    ResponsesResultPayload, SpawnRequestPayload, WorkerMessage,
};
use gambit_core::state::SavedState;
use gambit_core::types::{monotonic_now_ms, ChatTurn, RunResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Debounce before the first `onBusy` handler fires while a pass is in
/// flight.
pub const DEFAULT_STATUS_DELAY_MS: u64 = 800;

/// A busy-handler subscription active during a model request.
#[derive(Clone, Debug)]
pub(crate) struct BusyPing {
    pub path: String,
    pub repeat_ms: Option<u64>,
    pub run_id: String,
}

enum Wake {
    Deadline,
    Busy,
    Inbound(Option<ParentMessage>),
}

/// Terminal outcome of one proxied chat request.
pub(crate) enum ChatOutcome {
    Turn {
        turn: ChatTurn,
        progressed: bool,
    },
    /// The provider failed; `progressed` records whether token text had
    /// already streamed for this pass.
    ModelError {
        message: String,
        progressed: bool,
    },
}

/// Terminal outcome of one proxied responses request.
pub(crate) enum ResponsesOutcome {
    Items {
        result: ResponsesResultPayload,
        progressed: bool,
    },
    ModelError {
        message: String,
        progressed: bool,
    },
}

/// The worker side of the bridge.
pub(crate) struct WorkerLink {
    pub session: String,
    pub rx: mpsc::Receiver<ParentMessage>,
    pub tx: mpsc::Sender<WorkerMessage>,
    pub deadline_ms: u64,
}

impl WorkerLink {
    pub fn new(
        session: String,
        rx: mpsc::Receiver<ParentMessage>,
        tx: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            session,
            rx,
            tx,
            deadline_ms: u64::MAX,
        }
    }

    pub fn check_deadline(&self) -> Result<()> {
        if monotonic_now_ms() > self.deadline_ms {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    fn remaining(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.saturating_sub(monotonic_now_ms()))
    }

    /// Wait for the next inbound message, a deadline expiry, or (when a
    /// busy handler is armed) the busy timer.
    async fn wake(
        rx: &mut mpsc::Receiver<ParentMessage>,
        remaining: Duration,
        busy_delay: Option<&mut std::pin::Pin<&mut tokio::time::Sleep>>,
    ) -> Wake {
        match busy_delay {
            Some(busy_delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => Wake::Deadline,
                    _ = busy_delay => Wake::Busy,
                    msg = rx.recv() => Wake::Inbound(msg),
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => Wake::Deadline,
                    msg = rx.recv() => Wake::Inbound(msg),
                }
            }
        }
    }

    pub async fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::WorkerTerminated)
    }

    pub async fn publish_state(&self, state: &SavedState) -> Result<()> {
        self.send(WorkerMessage::StateUpdate {
            bridge_session: self.session.clone(),
            state: state.clone(),
        })
        .await
    }

    pub async fn stream_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(WorkerMessage::StreamText {
            bridge_session: self.session.clone(),
            text: text.into(),
        })
        .await
    }

    pub async fn log(&self, level: &str, message: impl Into<String>) -> Result<()> {
        self.send(WorkerMessage::LogEntry {
            bridge_session: self.session.clone(),
            level: level.to_string(),
            message: message.into(),
        })
        .await
    }

    pub async fn trace(&self, event: serde_json::Value) -> Result<()> {
        self.send(WorkerMessage::TraceEvent {
            bridge_session: self.session.clone(),
            event,
        })
        .await
    }

    /// Fire a side-effect spawn without waiting for its result; the
    /// eventual `spawn.result` is discarded as stale.
    pub async fn spawn_detached(&self, payload: SpawnRequestPayload) -> Result<()> {
        self.send(WorkerMessage::SpawnRequest {
            bridge_session: self.session.clone(),
            request_id: new_id("req"),
            payload,
        })
        .await
    }

    /// Issue a chat request and pump the bridge until the terminal reply.
    /// Streamed tokens are re-published as `stream.text`; trace events are
    /// forwarded.
    pub async fn request_chat(
        &mut self,
        payload: ChatRequestPayload,
        busy: Option<BusyPing>,
    ) -> Result<ChatOutcome> {
        self.check_deadline()?;
        let request_id = new_id("req");
        self.send(WorkerMessage::ModelChatRequest {
            bridge_session: self.session.clone(),
            request_id: request_id.clone(),
            payload,
        })
        .await?;

        let mut progressed = false;
        let busy_delay = tokio::time::sleep(Duration::from_millis(DEFAULT_STATUS_DELAY_MS));
        tokio::pin!(busy_delay);
        let mut busy_armed = busy.is_some();

        loop {
            let remaining = self.remaining();
            let wake = Self::wake(
                &mut self.rx,
                remaining,
                busy_armed.then_some(&mut busy_delay),
            )
            .await;

            match wake {
                Wake::Deadline => return Err(Error::Timeout),
                Wake::Busy => {
                    let ping = busy.as_ref().expect("busy timer only armed with a handler");
                    self.fire_busy(ping).await?;
                    match ping.repeat_ms {
                        Some(repeat) => busy_delay
                            .as_mut()
                            .reset(tokio::time::Instant::now() + Duration::from_millis(repeat)),
                        None => busy_armed = false,
                    }
                }
                Wake::Inbound(None) => return Err(Error::WorkerTerminated),
                Wake::Inbound(Some(msg)) => {
                    if msg.bridge_session() != self.session {
                        continue;
                    }
                    match msg {
                        ParentMessage::ModelChatResult {
                            request_id: rid,
                            turn,
                            ..
                        } if rid == request_id => {
                            return Ok(ChatOutcome::Turn { turn, progressed })
                        }
                        ParentMessage::ModelChatError {
                            request_id: rid,
                            error,
                            ..
                        } if rid == request_id => {
                            return Ok(ChatOutcome::ModelError {
                                message: error.message,
                                progressed,
                            });
                        }
                        ParentMessage::ModelChatStream {
                            request_id: rid,
                            text,
                            ..
                        } if rid == request_id => {
                            progressed = true;
                            self.stream_text(text).await?;
                        }
                        ParentMessage::ModelChatTrace { event, .. }
                        | ParentMessage::ModelResponsesTrace { event, .. } => {
                            self.trace(event).await?;
                        }
                        other => {
                            debug!(kind = message_kind(&other), "stale bridge message ignored");
                        }
                    }
                }
            }
        }
    }

    /// Issue a responses request and pump the bridge until the terminal
    /// reply. Streamed events are forwarded as `trace.event`.
    pub async fn request_responses(
        &mut self,
        payload: ResponsesRequestPayload,
        busy: Option<BusyPing>,
    ) -> Result<ResponsesOutcome> {
        self.check_deadline()?;
        let request_id = new_id("req");
        self.send(WorkerMessage::ModelResponsesRequest {
            bridge_session: self.session.clone(),
            request_id: request_id.clone(),
            payload,
        })
        .await?;

        let mut progressed = false;
        let busy_delay = tokio::time::sleep(Duration::from_millis(DEFAULT_STATUS_DELAY_MS));
        tokio::pin!(busy_delay);
        let mut busy_armed = busy.is_some();

        loop {
            let remaining = self.remaining();
            let wake = Self::wake(
                &mut self.rx,
                remaining,
                busy_armed.then_some(&mut busy_delay),
            )
            .await;

            match wake {
                Wake::Deadline => return Err(Error::Timeout),
                Wake::Busy => {
                    let ping = busy.as_ref().expect("busy timer only armed with a handler");
                    self.fire_busy(ping).await?;
                    match ping.repeat_ms {
                        Some(repeat) => busy_delay
                            .as_mut()
                            .reset(tokio::time::Instant::now() + Duration::from_millis(repeat)),
                        None => busy_armed = false,
                    }
                }
                Wake::Inbound(None) => return Err(Error::WorkerTerminated),
                Wake::Inbound(Some(msg)) => {
                    if msg.bridge_session() != self.session {
                        continue;
                    }
                    match msg {
                        ParentMessage::ModelResponsesResult {
                            request_id: rid,
                            result,
                            ..
                        } if rid == request_id => {
                            return Ok(ResponsesOutcome::Items { result, progressed })
                        }
                        ParentMessage::ModelResponsesError {
                            request_id: rid,
                            error,
                            ..
                        } if rid == request_id => {
                            return Ok(ResponsesOutcome::ModelError {
                                message: error.message,
                                progressed,
                            });
                        }
                        ParentMessage::ModelResponsesEvent {
                            request_id: rid,
                            event,
                            ..
                        } if rid == request_id => {
                            progressed = true;
                            self.trace(event).await?;
                        }
                        ParentMessage::ModelResponsesTrace { event, .. } => {
                            self.trace(event).await?;
                        }
                        other => {
                            debug!(kind = message_kind(&other), "stale bridge message ignored");
                        }
                    }
                }
            }
        }
    }

    pub async fn request_resolve_model(&mut self, model_id: &str) -> Result<ResolvedModel> {
        self.check_deadline()?;
        let request_id = new_id("req");
        self.send(WorkerMessage::ModelResolveModelRequest {
            bridge_session: self.session.clone(),
            request_id: request_id.clone(),
            model_id: model_id.to_string(),
        })
        .await?;

        loop {
            let remaining = self.remaining();
            match Self::wake(&mut self.rx, remaining, None).await {
                Wake::Deadline => return Err(Error::Timeout),
                Wake::Busy => continue,
                Wake::Inbound(None) => return Err(Error::WorkerTerminated),
                Wake::Inbound(Some(msg)) => {
                    if msg.bridge_session() != self.session {
                        continue;
                    }
                    match msg {
                        ParentMessage::ModelResolveModelResult {
                            request_id: rid,
                            resolved,
                            ..
                        } if rid == request_id => return Ok(resolved),
                        ParentMessage::ModelResolveModelError {
                            request_id: rid,
                            error,
                            ..
                        } if rid == request_id => return Err(Error::Model(error.message)),
                        _ => continue,
                    }
                }
            }
        }
    }

    pub async fn request_spawn(&mut self, payload: SpawnRequestPayload) -> Result<RunResult> {
        let mut results = self.request_spawn_batch(vec![payload]).await?;
        results.pop().expect("one result per request")
    }

    /// Dispatch a batch of spawns concurrently and wait for every reply.
    /// Results come back in request order.
    pub async fn request_spawn_batch(
        &mut self,
        payloads: Vec<SpawnRequestPayload>,
    ) -> Result<Vec<Result<RunResult>>> {
        self.check_deadline()?;
        let mut order: HashMap<String, usize> = HashMap::new();
        let mut results: Vec<Option<Result<RunResult>>> = Vec::new();
        for payload in payloads {
            let request_id = new_id("req");
            order.insert(request_id.clone(), results.len());
            results.push(None);
            self.send(WorkerMessage::SpawnRequest {
                bridge_session: self.session.clone(),
                request_id,
                payload,
            })
            .await?;
        }

        let mut outstanding = results.len();
        while outstanding > 0 {
            let remaining = self.remaining();
            match Self::wake(&mut self.rx, remaining, None).await {
                Wake::Deadline => return Err(Error::Timeout),
                Wake::Busy => continue,
                Wake::Inbound(None) => return Err(Error::WorkerTerminated),
                Wake::Inbound(Some(msg)) => {
                    if msg.bridge_session() != self.session {
                        continue;
                    }
                    match msg {
                        ParentMessage::SpawnResult {
                            request_id, result, ..
                        } => {
                            if let Some(&index) = order.get(&request_id) {
                                if results[index].is_none() {
                                    results[index] = Some(Ok(result));
                                    outstanding -= 1;
                                }
                            }
                        }
                        ParentMessage::SpawnError {
                            request_id, error, ..
                        } => {
                            if let Some(&index) = order.get(&request_id) {
                                if results[index].is_none() {
                                    results[index] = Some(Err(error.into_error()));
                                    outstanding -= 1;
                                }
                            }
                        }
                        _ => continue,
                    }
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.expect("all spawn replies received"))
            .collect())
    }

    async fn fire_busy(&self, ping: &BusyPing) -> Result<()> {
        debug!(handler = %ping.path, "onBusy handler fired");
        self.spawn_detached(SpawnRequestPayload {
            path: ping.path.clone(),
            name: None,
            input: serde_json::json!({ "status": "busy", "runId": ping.run_id }),
            label: Some("onBusy".to_string()),
            action_call_id: None,
        })
        .await
    }

    /// Post the terminal result.
    pub async fn finish(
        &self,
        nonce: &str,
        result: RunResult,
        state: Option<SavedState>,
    ) -> Result<()> {
        self.send(WorkerMessage::RunResult {
            bridge_session: self.session.clone(),
            completion_nonce: nonce.to_string(),
            result,
            state,
        })
        .await
    }

    /// Post the terminal error.
    pub async fn fail(&self, nonce: &str, error: ErrorPayload) -> Result<()> {
        self.send(WorkerMessage::RunError {
            bridge_session: self.session.clone(),
            completion_nonce: nonce.to_string(),
            error,
        })
        .await
    }
}

fn message_kind(msg: &ParentMessage) -> &'static str {
    match msg {
        ParentMessage::RunStart { .. } => "run.start",
        ParentMessage::DeckInspect { .. } => "deck.inspect",
        ParentMessage::ModelChatResult { .. } => "model.chat.result",
        ParentMessage::ModelResponsesResult { .. } => "model.responses.result",
        ParentMessage::ModelResolveModelResult { .. } => "model.resolveModel.result",
        ParentMessage::ModelChatStream { .. } => "model.chat.stream",
        ParentMessage::ModelResponsesEvent { .. } => "model.responses.event",
        ParentMessage::ModelChatTrace { .. } => "model.chat.trace",
        ParentMessage::ModelResponsesTrace { .. } => "model.responses.trace",
        ParentMessage::ModelChatError { .. } => "model.chat.error",
        ParentMessage::ModelResponsesError { .. } => "model.responses.error",
        ParentMessage::ModelResolveModelError { .. } => "model.resolveModel.error",
        ParentMessage::SpawnResult { .. } => "spawn.result",
        ParentMessage::SpawnError { .. } => "spawn.error",
    }
}

// ---------------------------------------------------------------------------
// Parent-side client for worker requests outside a run
// ---------------------------------------------------------------------------

type PendingInspect = Arc<dashmap::DashMap<String, oneshot::Sender<Result<serde_json::Value>>>>;

/// Parent-side handle over a worker used for `deck.inspect` round trips.
/// Pending entries are resolved on their terminal reply and rejected with
/// `WorkerTerminated` when the worker goes away.
pub struct WorkerClient {
    session: String,
    to_worker: mpsc::Sender<ParentMessage>,
    pending: PendingInspect,
}

impl WorkerClient {
    pub(crate) fn new(
        session: String,
        to_worker: mpsc::Sender<ParentMessage>,
        mut from_worker: mpsc::Receiver<WorkerMessage>,
    ) -> Self {
        let pending: PendingInspect = Arc::new(dashmap::DashMap::new());
        let pump_pending = pending.clone();
        let pump_session = session.clone();
        tokio::spawn(async move {
            while let Some(msg) = from_worker.recv().await {
                if msg.bridge_session() != pump_session {
                    continue;
                }
                match msg {
                    WorkerMessage::DeckInspectResult {
                        request_id, deck, ..
                    } => {
                        if let Some((_, sender)) = pump_pending.remove(&request_id) {
                            let _ = sender.send(Ok(deck));
                        }
                    }
                    WorkerMessage::DeckInspectError {
                        request_id, error, ..
                    } => {
                        if let Some((_, sender)) = pump_pending.remove(&request_id) {
                            let _ = sender.send(Err(error.into_error()));
                        }
                    }
                    other => {
                        debug!(session = %other.bridge_session(), "unexpected worker message outside a run");
                    }
                }
            }
            // Worker gone: reject everything still pending.
            let keys: Vec<String> = pump_pending.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, sender)) = pump_pending.remove(&key) {
                    let _ = sender.send(Err(Error::WorkerTerminated));
                }
            }
            if !pump_pending.is_empty() {
                warn!("pending inspect entries survived the termination sweep");
            }
        });

        Self {
            session,
            to_worker,
            pending,
        }
    }

    pub async fn inspect(&self, path: &str) -> Result<serde_json::Value> {
        let request_id = new_id("req");
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        self.to_worker
            .send(ParentMessage::DeckInspect {
                bridge_session: self.session.clone(),
                request_id,
                path: path.to_string(),
            })
            .await
            .map_err(|_| Error::WorkerTerminated)?;
        rx.await.map_err(|_| Error::WorkerTerminated)?
    }
}
