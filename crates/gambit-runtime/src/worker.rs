//! Worker task entry — one task per spawned worker.
//!
//! A worker accepts exactly one `run.start`; duplicates are silently
//! dropped. `deck.inspect` requests are answered between runs. The deck
//! kind decides the path: executor decks run the compute worker,
//! everything else drives the orchestration loop.

use crate::bridge::WorkerLink;
use crate::compute::run_compute;
use crate::executor::ExecutorRegistry;
use crate::orchestrator::{fire_error_handler, run_orchestration};
use gambit_core::error::{Error, Result};
use gambit_core::protocol::{ParentMessage, RunStartOptions, WorkerMessage};
use gambit_core::state::SavedState;
use gambit_core::types::RunResult;
use gambit_deck::{load_deck, ActionTarget, LoadedDeck};
use gambit_sandbox::{PermissionSet, SandboxSpec};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) async fn worker_main(
    mut link: WorkerLink,
    executors: Arc<ExecutorRegistry>,
    permissions: PermissionSet,
    sandbox: SandboxSpec,
) {
    debug!(session = %link.session, sandbox = %serde_json::to_string(&sandbox).unwrap_or_default(), "worker online");
    let mut started = false;

    loop {
        let msg = match link.rx.recv().await {
            Some(msg) => msg,
            None => break,
        };
        if msg.bridge_session() != link.session {
            continue;
        }

        match msg {
            ParentMessage::RunStart {
                completion_nonce,
                options,
                ..
            } => {
                if started {
                    debug!(session = %link.session, "duplicate run.start dropped");
                    continue;
                }
                started = true;
                link.deadline_ms = options.run_deadline_ms;

                match execute_run(&mut link, &executors, &permissions, &options).await {
                    Ok((result, state)) => {
                        let _ = link.finish(&completion_nonce, result, Some(state)).await;
                    }
                    Err((error, deck)) => {
                        if let Some(deck) = deck {
                            fire_error_handler(&link, &deck, &error).await;
                        }
                        info!(session = %link.session, error = %error, "run failed");
                        let _ = link.fail(&completion_nonce, error.to_payload("worker")).await;
                    }
                }
            }
            ParentMessage::DeckInspect {
                request_id, path, ..
            } => {
                let reply = match inspect_deck_summary(&path) {
                    Ok(deck) => WorkerMessage::DeckInspectResult {
                        bridge_session: link.session.clone(),
                        request_id,
                        deck,
                    },
                    Err(error) => WorkerMessage::DeckInspectError {
                        bridge_session: link.session.clone(),
                        request_id,
                        error: error.to_payload("worker"),
                    },
                };
                if link.send(reply).await.is_err() {
                    break;
                }
            }
            _ => {
                // Replies without an in-flight request are stale.
            }
        }
    }
}

type RunFailure = (Error, Option<LoadedDeck>);

async fn execute_run(
    link: &mut WorkerLink,
    executors: &ExecutorRegistry,
    permissions: &PermissionSet,
    options: &RunStartOptions,
) -> std::result::Result<(RunResult, SavedState), RunFailure> {
    let deck = load_deck(&options.deck_path).map_err(|e| (e, None))?;

    let outcome = if deck.executor.is_some() {
        run_compute(link, &deck, executors, permissions, options).await
    } else {
        run_orchestration(link, &deck, executors, options).await
    };
    outcome.map_err(|e| (e, Some(deck)))
}

/// Summarize a deck for `deck.inspect` without running it.
fn inspect_deck_summary(path: &str) -> Result<serde_json::Value> {
    let deck = load_deck(path)?;
    let actions: Vec<serde_json::Value> = deck
        .actions
        .iter()
        .map(|a| {
            json!({
                "name": a.name,
                "description": a.description,
                "kind": match a.target {
                    ActionTarget::Deck(_) => "deck",
                    ActionTarget::Executor(_) => "executor",
                },
                "parallel": a.parallel,
            })
        })
        .collect();
    Ok(json!({
        "path": deck.path.display().to_string(),
        "label": deck.label,
        "respond": deck.respond,
        "allowEnd": deck.allow_end,
        "executor": deck.executor.as_ref().map(|e| e.key.clone()),
        "actions": actions,
        "cards": deck.cards.len(),
        "hasContextSchema": deck.context_schema.is_some(),
        "hasResponseSchema": deck.response_schema.is_some(),
    }))
}
